#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use poem::http::header;
use poem::middleware::{Cors, CorsEndpoint};
use poem::{Endpoint, Middleware, Request, Result};

// ***************************************************************************
//                               CORS Policy
// ***************************************************************************
// ---------------------------------------------------------------------------
// CorsPolicy:
// ---------------------------------------------------------------------------
/** The cross-origin policy applied to every route.  Listed origins get the
 * permissive CORS headers (any method, any header, which is how poem treats
 * empty method and header lists).  Requests from any other origin are served
 * as plain requests, without CORS headers, so the browser decides whether
 * the page may read the response.
 *
 * The origin list must be non-empty and made of valid header values (see
 * Config::validate); poem's Cors admits every origin when its list is empty.
 */
pub struct CorsPolicy {
    cors: Cors,
    allowed: Arc<HashSet<String>>,
}

impl CorsPolicy {
    pub fn new(allowed_origins: &[String]) -> Self {
        Self {
            cors: Cors::new().allow_origins(allowed_origins.iter().map(String::as_str)),
            allowed: Arc::new(allowed_origins.iter().cloned().collect()),
        }
    }
}

impl<E: Endpoint> Middleware<E> for CorsPolicy {
    type Output = CorsPolicyEndpoint<CorsEndpoint<E>>;

    fn transform(&self, ep: E) -> Self::Output {
        CorsPolicyEndpoint {
            inner: self.cors.transform(ep),
            allowed: self.allowed.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// CorsPolicyEndpoint:
// ---------------------------------------------------------------------------
pub struct CorsPolicyEndpoint<E> {
    inner: E,
    allowed: Arc<HashSet<String>>,
}

impl<E: Endpoint> Endpoint for CorsPolicyEndpoint<E> {
    type Output = E::Output;

    async fn call(&self, mut req: Request) -> Result<Self::Output> {
        // Drop an unlisted Origin so poem's Cors treats the call as a plain
        // request instead of refusing it.
        let unlisted = match req.headers().get(header::ORIGIN) {
            Some(origin) => origin.to_str().map_or(true, |o| !self.allowed.contains(o)),
            None => false,
        };
        if unlisted {
            debug!("Serving request from unlisted origin {:?} without CORS headers.",
                   req.headers().get(header::ORIGIN));
            req.headers_mut().remove(header::ORIGIN);
        }
        self.inner.call(req).await
    }
}
