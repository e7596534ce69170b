use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use http::{Request, Response};
use ostor_core::auth::TokenVerifier;
use tonic::Status;
use tower::{Layer, Service};

use crate::error::AppError;

use super::{auth_method, authorization_header, label_header};

/// 拒绝 token 未授予该 label 上对应方法权限的请求。
#[derive(Clone)]
pub struct AuthLayer {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthLayer {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// verifier 接受一切请求时返回 `None`，此时不挂载该层。
    pub fn for_verifier(verifier: Arc<dyn TokenVerifier>) -> Option<Self> {
        if verifier.is_noop() {
            None
        } else {
            Some(Self::new(verifier))
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = Auth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Auth {
            inner,
            verifier: self.verifier.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Auth<S> {
    inner: S,
    verifier: Arc<dyn TokenVerifier>,
}

impl<S> Auth<S> {
    fn authorize<B>(&self, req: &Request<B>) -> Result<(), AppError> {
        let headers = req.headers();
        let label = label_header(headers).ok_or(AppError::NilLabel)?;
        let method = auth_method(req.uri().path()).ok_or(AppError::Unimplemented)?;
        self.verifier
            .verify(authorization_header(headers), method, label)
            .map_err(|e| {
                tracing::debug!(label, %method, error = %e, "request not authorized");
                AppError::PermissionDenied
            })
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Auth<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if let Err(err) = self.authorize(&req) {
            let response = Status::from(err).into_http();
            return Box::pin(async move { Ok(response) });
        }

        // 必须由已 ready 的那个 service 处理本次调用
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(inner.call(req))
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use ostor_core::auth::NopVerifier;
    use tonic::Code;
    use tower::ServiceExt;

    use super::*;
    use crate::test::{jwt_verifier, sign_token as token};

    fn layer() -> AuthLayer {
        AuthLayer::for_verifier(jwt_verifier()).unwrap()
    }

    fn request(path: &str, label: Option<&str>, token: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(format!("http://localhost{path}"));
        if let Some(label) = label {
            builder = builder.header("label", label);
        }
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(()).unwrap()
    }

    /// 让请求经过该层，到达 handler 时返回 `Ok`。
    async fn call(layer: &AuthLayer, req: Request<()>) -> Result<(), Code> {
        let inner = tower::service_fn(|_: Request<()>| async {
            Ok::<_, Infallible>(Response::new(String::from("handled")))
        });
        let resp = layer.layer(inner).oneshot(req).await.unwrap();
        if resp.body() == "handled" {
            return Ok(());
        }
        let status = Status::from_header_map(resp.headers()).expect("grpc status header");
        Err(status.code())
    }

    #[test]
    fn nop_verifier_skips_the_layer() {
        assert!(AuthLayer::for_verifier(Arc::new(NopVerifier)).is_none());
    }

    #[tokio::test]
    async fn missing_label() {
        let t = token(&["org.0stor.ns"]);
        let req = request("/ostor.ObjectManager/GetObject", None, Some(t.as_str()));
        assert_eq!(call(&layer(), req).await, Err(Code::Unauthenticated));
    }

    #[tokio::test]
    async fn unknown_method() {
        let t = token(&["org.0stor.ns"]);
        let req = request("/ostor.ObjectManager/Frobnicate", Some("org_0stor_ns"), Some(t.as_str()));
        assert_eq!(call(&layer(), req).await, Err(Code::Unimplemented));
    }

    #[tokio::test]
    async fn missing_or_bad_token_is_denied() {
        let layer = layer();
        let req = request("/ostor.ObjectManager/GetObject", Some("org_0stor_ns"), None);
        assert_eq!(call(&layer, req).await, Err(Code::PermissionDenied));

        let req = request(
            "/ostor.ObjectManager/GetObject",
            Some("org_0stor_ns"),
            Some("garbage"),
        );
        assert_eq!(call(&layer, req).await, Err(Code::PermissionDenied));
    }

    #[tokio::test]
    async fn read_scope_only_reads() {
        let layer = layer();
        let t = token(&["user:memberof:org.0stor.ns.read"]);
        let call_as = |path: &str| request(path, Some("org_0stor_ns"), Some(t.as_str()));

        assert_eq!(call(&layer, call_as("/ostor.ObjectManager/GetObject")).await, Ok(()));
        assert_eq!(
            call(&layer, call_as("/ostor.ObjectManager/ListObjectKeys")).await,
            Ok(())
        );
        for path in [
            "/ostor.ObjectManager/SetObject",
            "/ostor.ObjectManager/DeleteObject",
            "/ostor.NamespaceManager/GetNamespace",
        ] {
            assert_eq!(call(&layer, call_as(path)).await, Err(Code::PermissionDenied), "{path}");
        }
    }

    #[tokio::test]
    async fn token_for_other_label_is_denied() {
        let t = token(&["org.0stor.other"]);
        let req = request("/ostor.ObjectManager/GetObject", Some("org_0stor_ns"), Some(t.as_str()));
        assert_eq!(call(&layer(), req).await, Err(Code::PermissionDenied));
    }
}
