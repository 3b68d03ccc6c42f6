use core::str::FromStr;

use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use velopay_auth::{Principal, PrincipalId, Role};

use crate::context::PrincipalContext;

/// Resolve the acting principal from gateway-injected headers.
///
/// Authentication happens upstream; by the time a request reaches this
/// service the gateway has verified the caller and attached:
///
/// - `X-Principal-Id`: the principal's UUID (required)
/// - `X-Principal-Roles`: comma-separated role names
/// - `X-Account-Code`: the principal's public account code, if any
/// - `X-Display-Name`: optional display name
///
/// Requests without a valid principal id are refused outright.
pub async fn principal_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let principal = extract_principal(req.headers())?;

    req.extensions_mut().insert(PrincipalContext::new(principal));

    Ok(next.run(req).await)
}

fn extract_principal(headers: &HeaderMap) -> Result<Principal, StatusCode> {
    let id = header_str(headers, "x-principal-id").ok_or(StatusCode::UNAUTHORIZED)?;
    let id = PrincipalId::from_str(id).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let roles = header_str(headers, "x-principal-roles")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(|r| Role::new(r.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut principal = Principal::new(id, roles);
    if let Some(code) = header_str(headers, "x-account-code") {
        principal = principal.with_account_code(code);
    }
    if let Some(name) = header_str(headers, "x-display-name") {
        principal = principal.with_display_name(name);
    }

    Ok(principal)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    let value = headers.get(name)?.to_str().ok()?;
    let value = value.trim();
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_full_principal() {
        let id = PrincipalId::new();
        let mut headers = HeaderMap::new();
        headers.insert("x-principal-id", HeaderValue::from_str(&id.to_string()).unwrap());
        headers.insert("x-principal-roles", HeaderValue::from_static("agent, client"));
        headers.insert("x-account-code", HeaderValue::from_static("9731"));

        let principal = extract_principal(&headers).unwrap();
        assert_eq!(principal.id, id);
        assert!(principal.has_role("agent"));
        assert!(principal.has_role("client"));
        assert_eq!(principal.account_code.as_deref(), Some("9731"));
    }

    #[test]
    fn missing_or_malformed_id_is_unauthorized() {
        let headers = HeaderMap::new();
        assert_eq!(extract_principal(&headers).unwrap_err(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        headers.insert("x-principal-id", HeaderValue::from_static("not-a-uuid"));
        assert_eq!(extract_principal(&headers).unwrap_err(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn roles_header_is_optional() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-principal-id",
            HeaderValue::from_str(&PrincipalId::new().to_string()).unwrap(),
        );

        let principal = extract_principal(&headers).unwrap();
        assert!(principal.roles.is_empty());
    }
}
