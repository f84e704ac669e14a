use axum::{extract::ConnectInfo, response::Response};
use http::{HeaderMap, Request};
use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::warn;

use crate::{
    limiter::{AdmissionController, ClassifiedRequest, UNKNOWN_CLIENT},
    response::{annotate, rejection_response},
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Resolve the client identifier for a request.
///
/// First entry of `X-Forwarded-For`, then `X-Real-IP`, then the transport peer
/// address, then `"unknown"`. Every unidentifiable client shares the one
/// `"unknown"` bucket.
pub fn resolve_client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = header_value(headers, X_FORWARDED_FOR)
        .and_then(|forwarded| forwarded.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_value(headers, X_REAL_IP) {
        return real_ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Layer that puts an [`AdmissionController`] in front of a service
#[derive(Clone)]
pub struct AdmissionLayer {
    controller: Arc<AdmissionController>,
}

impl AdmissionLayer {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionMiddleware {
            inner,
            controller: self.controller.clone(),
        }
    }
}

/// Admission control middleware service
#[derive(Clone)]
pub struct AdmissionMiddleware<S> {
    inner: S,
    controller: Arc<AdmissionController>,
}

impl<S, B> Service<Request<B>> for AdmissionMiddleware<S>
where
    S: Service<Request<B>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let controller = self.controller.clone();
        // Drive the instance that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if !controller.is_enabled() {
                return inner.call(request).await;
            }

            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr);
            let client = resolve_client_identifier(request.headers(), peer);
            let classified = ClassifiedRequest::new(
                request.uri().path(),
                request.method().as_str(),
                &client,
            );

            let decision = match controller.check(&classified).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        error = %e,
                        client_ip = %classified.client_identifier,
                        path = %classified.path,
                        "Admission check failed, forwarding request unchecked"
                    );
                    if let Some(metrics) = controller.metrics() {
                        metrics.record_store_failure();
                    }
                    return inner.call(request).await;
                }
            };

            if !decision.allowed {
                return Ok(rejection_response(
                    &decision,
                    controller.rejection_status(),
                    controller.unix_now(),
                ));
            }

            let mut response = inner.call(request).await?;
            annotate(&mut response, &decision, controller.unix_now());
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for &(name, value) in pairs {
            map.insert(name, HeaderValue::from_static(value));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.20:51234".parse().unwrap())
    }

    #[test]
    fn test_forwarded_for_takes_first_entry() {
        let map = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1, 10.0.0.2"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(resolve_client_identifier(&map, peer()), "203.0.113.7");
    }

    #[test]
    fn test_real_ip_when_no_forwarded_for() {
        let map = headers(&[("x-real-ip", " 198.51.100.1 ")]);
        assert_eq!(resolve_client_identifier(&map, peer()), "198.51.100.1");
    }

    #[test]
    fn test_empty_headers_fall_through() {
        let map = headers(&[("x-forwarded-for", ""), ("x-real-ip", "  ")]);
        assert_eq!(resolve_client_identifier(&map, peer()), "192.168.1.20");
    }

    #[test]
    fn test_empty_leading_forwarded_entry_is_skipped() {
        let map = headers(&[
            ("x-forwarded-for", ", 203.0.113.7"),
            ("x-real-ip", "198.51.100.1"),
        ]);
        assert_eq!(resolve_client_identifier(&map, peer()), "198.51.100.1");

        let map = headers(&[("x-forwarded-for", " ,10.0.0.1")]);
        assert_eq!(resolve_client_identifier(&map, peer()), "192.168.1.20");
    }

    #[test]
    fn test_peer_address_then_unknown() {
        assert_eq!(
            resolve_client_identifier(&HeaderMap::new(), peer()),
            "192.168.1.20"
        );
        assert_eq!(
            resolve_client_identifier(&HeaderMap::new(), None),
            "unknown"
        );

        let v6: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(
            resolve_client_identifier(&HeaderMap::new(), Some(v6)),
            "2001:db8::1"
        );
    }
}
