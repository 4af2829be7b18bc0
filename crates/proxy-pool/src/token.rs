use std::future::Future;

use proxy_core::{now_unix, CredentialRecord, ProxyError};

/// 60-second safety margin before expiry within which a session token is
/// treated as already-expired and refreshed ahead of time.
pub const SESSION_TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

/// Exchanges a long-lived credential for a fresh short-lived session token,
/// or returns the still-valid one (C4).
///
/// `exchange` performs the actual upstream token-exchange RPC; this function
/// only owns the compare-and-set decision and the bookkeeping around it. On
/// failure the credential is marked inactive so the pool selects past it.
pub async fn ensure_fresh_token<F, Fut>(
    cred: &mut CredentialRecord,
    exchange: F,
) -> Result<String, ProxyError>
where
    F: FnOnce(&CredentialRecord) -> Fut,
    Fut: Future<Output = Result<(String, i64), ProxyError>>,
{
    let now = now_unix();
    if let (Some(token), Some(expires_at)) = (&cred.session_token, cred.session_token_expires_at) {
        if expires_at - SESSION_TOKEN_SAFETY_MARGIN_SECS > now {
            return Ok(token.clone());
        }
    }

    match exchange(cred).await {
        Ok((token, expires_in_secs)) => {
            cred.session_token = Some(token.clone());
            cred.session_token_expires_at = Some(now + expires_in_secs);
            Ok(token)
        }
        Err(e) => {
            cred.active = false;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_existing_token_when_not_near_expiry() {
        let mut cred = CredentialRecord::new("a", "A", "secret");
        cred.session_token = Some("tok-1".into());
        cred.session_token_expires_at = Some(now_unix() + 3600);

        let called = std::cell::Cell::new(false);
        let token = ensure_fresh_token(&mut cred, |_| {
            called.set(true);
            async { Ok(("new".to_string(), 60)) }
        })
        .await
        .unwrap();

        assert_eq!(token, "tok-1");
        assert!(!called.get());
    }

    #[tokio::test]
    async fn refreshes_when_within_safety_margin() {
        let mut cred = CredentialRecord::new("a", "A", "secret");
        cred.session_token = Some("tok-old".into());
        cred.session_token_expires_at = Some(now_unix() + 30);

        let token = ensure_fresh_token(&mut cred, |_| async { Ok(("tok-new".to_string(), 900)) })
            .await
            .unwrap();

        assert_eq!(token, "tok-new");
        assert_eq!(cred.session_token.as_deref(), Some("tok-new"));
    }

    #[tokio::test]
    async fn exchange_failure_deactivates_credential() {
        let mut cred = CredentialRecord::new("a", "A", "secret");
        let result = ensure_fresh_token(&mut cred, |_| async {
            Err(ProxyError::UpstreamAuthError("401".into()))
        })
        .await;

        assert!(result.is_err());
        assert!(!cred.active);
    }
}
