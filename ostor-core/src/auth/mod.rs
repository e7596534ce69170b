//! Bearer token 校验。
//!
//! Token 是 ES384 签名的 JWT，带有 `scope` 数组和 `exp` 时间戳。
//! label `<org>_0stor_<ns>` 由 scope `<org>.0stor.<ns>`（完全访问）
//! 或 `<org>.0stor.<ns>.<method>` 授权。

mod cache;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use thiserror::Error;

use cache::{CACHE_SIZE, Lookup, TokenCache};

use crate::keys;

const LABEL_INFIX: &str = "_0stor_";
const SCOPE_INFIX: &str = ".0stor.";
const MEMBER_OF_PREFIX: &str = "user:memberof:";

/// 请求对 namespace 执行的操作类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Read,
    Write,
    Delete,
    Admin,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Read => "read",
            Method::Write => "write",
            Method::Delete => "delete",
            Method::Admin => "admin",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no jwt token given")]
    NoToken,
    #[error("token is not signed with ES384")]
    InvalidAlgorithm,
    #[error("token signature does not match")]
    InvalidSignature,
    #[error("token claims are malformed")]
    MalformedClaims,
    #[error("token expired")]
    Expired,
    #[error("token doesn't contain the required scopes")]
    WrongScopes,
    #[error("invalid namespace label: {0}")]
    InvalidLabel(String),
    #[error("invalid token")]
    InvalidToken,
    #[error("failed to parse public key: {0}")]
    InvalidKey(String),
}

pub trait TokenVerifier: Send + Sync {
    /// 检查 `token` 是否授予了 `label` 上的 `method` 权限。
    fn verify(&self, token: Option<&str>, method: Method, label: &str) -> Result<(), AuthError>;

    /// 接受一切请求的 verifier 返回 true。
    fn is_noop(&self) -> bool {
        false
    }
}

/// 接受所有请求，在关闭鉴权时使用。
#[derive(Debug, Default, Clone, Copy)]
pub struct NopVerifier;

impl TokenVerifier for NopVerifier {
    fn verify(&self, _: Option<&str>, _: Method, _: &str) -> Result<(), AuthError> {
        Ok(())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    scope: Vec<String>,
    exp: i64,
}

/// 用一个公钥校验 ES384 token，并缓存校验结果。
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    cache: TokenCache,
}

impl JwtVerifier {
    /// `pem` 为 PEM 编码的 EC 公钥。
    pub fn new(pem: &[u8]) -> Result<Self, AuthError> {
        let key = DecodingKey::from_ec_pem(pem).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        let mut validation = Validation::new(Algorithm::ES384);
        validation.leeway = 0;
        validation.validate_aud = false;
        Ok(Self {
            key,
            validation,
            cache: TokenCache::new(CACHE_SIZE),
        })
    }

    fn scopes(&self, token: &str) -> Result<Arc<[String]>, AuthError> {
        let now = Utc::now().timestamp();
        match self.cache.get(token, now) {
            Lookup::Valid(scopes) => return Ok(scopes),
            Lookup::Rejected => return Err(AuthError::InvalidToken),
            Lookup::Miss => {}
        }

        match self.decode(token) {
            Ok(claims) if claims.exp > now => {
                let scopes: Arc<[String]> = claims.scope.into();
                self.cache.insert_valid(token, scopes.clone(), claims.exp);
                Ok(scopes)
            }
            Ok(_) => {
                self.cache.insert_invalid(token, now);
                Err(AuthError::Expired)
            }
            Err(e) => {
                self.cache.insert_invalid(token, now);
                Err(e)
            }
        }
    }

    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    AuthError::InvalidAlgorithm
                }
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                    AuthError::MalformedClaims
                }
                _ => AuthError::InvalidToken,
            })
    }

    #[cfg(test)]
    fn cached_tokens(&self) -> usize {
        self.cache.len()
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: Option<&str>, method: Method, label: &str) -> Result<(), AuthError> {
        let token = token
            .map(strip_bearer)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::NoToken)?;
        let scopes = self.scopes(token)?;
        let expected = expected_scopes(method, label)?;
        if has_any_scope(&expected, &scopes) {
            Ok(())
        } else {
            Err(AuthError::WrongScopes)
        }
    }
}

fn strip_bearer(token: &str) -> &str {
    token.strip_prefix("Bearer").unwrap_or(token).trim()
}

/// 授予 `label` 上 `method` 权限的 scope，最具体的在前。
pub fn expected_scopes(method: Method, label: &str) -> Result<Vec<String>, AuthError> {
    if !keys::is_valid_label(label.as_bytes())
        || label.matches(LABEL_INFIX).count() != 1
        || label.ends_with(LABEL_INFIX)
    {
        return Err(AuthError::InvalidLabel(label.to_string()));
    }
    let admin = label.replacen(LABEL_INFIX, SCOPE_INFIX, 1);
    Ok(match method {
        Method::Admin => vec![admin],
        _ => vec![format!("{admin}.{method}"), admin],
    })
}

fn has_any_scope(expected: &[String], granted: &[String]) -> bool {
    granted.iter().any(|scope| {
        let scope = scope.strip_prefix(MEMBER_OF_PREFIX).unwrap_or(scope);
        expected.iter().any(|e| e == scope)
    })
}
