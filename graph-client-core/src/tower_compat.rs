use crate::prelude::graphql::*;
use async_trait::async_trait;
use std::fmt;
use tower::util::ServiceExt;
use tower::BoxError;

/// Expose any tower [`tower::Service`] producing a [`ResponseStream`] as a
/// [`Link`], so transport chains can keep being assembled with
/// `ServiceBuilder` layers (retry, timeout, ...).
pub struct ServiceLink<S> {
    service: S,
}

impl<S> ServiceLink<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S> Clone for ServiceLink<S>
where
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S> fmt::Debug for ServiceLink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLink").finish()
    }
}

#[async_trait]
impl<S> Link for ServiceLink<S>
where
    S: tower::Service<Request, Response = ResponseStream> + Clone + Send + Sync + 'static,
    S::Error: Into<BoxError> + Send,
    S::Future: Send,
{
    async fn execute(&self, request: Request) -> ResponseStream {
        let service = self.service.clone();
        match service.oneshot(request).await {
            Ok(stream) => stream,
            Err(error) => FetchError::TransportError {
                reason: error.into().to_string(),
            }
            .into(),
        }
    }
}
