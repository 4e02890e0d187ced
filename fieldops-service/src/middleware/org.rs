//! Organization context for document routes.
//!
//! The organization comes from `X-Org-ID` and the acting user, when known,
//! from `X-User-ID`. Both are set by the gateway in front of this service.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const ORG_ID_HEADER: &str = "X-Org-ID";
pub const USER_ID_HEADER: &str = "X-User-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrgContext {
    pub org_id: Uuid,
    pub actor_id: Option<Uuid>,
}

fn header_uuid(parts: &Parts, name: &str) -> Result<Option<Uuid>, AppError> {
    let Some(value) = parts.headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| Uuid::parse_str(s.trim()).ok())
        .map(Some)
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("{} must be a UUID", name)))
}

#[async_trait]
impl<S> FromRequestParts<S> for OrgContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let org_id = header_uuid(parts, ORG_ID_HEADER)?.ok_or_else(|| {
            AppError::Unauthorized(anyhow::anyhow!("Missing {} header", ORG_ID_HEADER))
        })?;
        let actor_id = header_uuid(parts, USER_ID_HEADER)?;

        let span = tracing::Span::current();
        span.record("org_id", tracing::field::display(org_id));
        if let Some(actor_id) = actor_id {
            span.record("actor_id", tracing::field::display(actor_id));
        }

        Ok(OrgContext { org_id, actor_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<OrgContext, AppError> {
        let mut builder = Request::builder().uri("/quotes");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        OrgContext::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_org_and_actor() {
        let org_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        let ctx = extract(&[
            (ORG_ID_HEADER, &org_id.to_string()),
            (USER_ID_HEADER, &actor_id.to_string()),
        ])
        .await
        .unwrap();

        assert_eq!(ctx.org_id, org_id);
        assert_eq!(ctx.actor_id, Some(actor_id));
    }

    #[tokio::test]
    async fn missing_org_is_unauthorized() {
        let result = extract(&[]).await;
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn malformed_ids_are_bad_requests() {
        let result = extract(&[(ORG_ID_HEADER, "acme")]).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));

        let org_id = Uuid::new_v4().to_string();
        let result = extract(&[(ORG_ID_HEADER, &org_id), (USER_ID_HEADER, "bob")]).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
