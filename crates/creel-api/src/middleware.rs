use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// The verified caller identity. The fronting auth layer authenticates the
/// account and forwards its id in the `x-account-id` header; this core
/// never authenticates anything itself.
#[derive(Debug, Clone, Copy)]
pub struct Identity(pub Uuid);

pub const ACCOUNT_HEADER: &str = "x-account-id";

/// Extract the verified account id set by the fronting auth layer.
pub async fn require_identity(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let account = req
        .headers()
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<Uuid>().ok())
        .filter(|id| !id.is_nil())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(Identity(account));
    Ok(next.run(req).await)
}
