use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-remote credential and custom-login capability, injected into a
/// [`ReplicationCore`](crate::replication::ReplicationCore). Implementations
/// are long-lived, thread-safe, and may be shared across replications
/// (spec.md §3).
pub trait Authorizer: Send + Sync {
    /// Whether this authorizer drives the `/_session` cookie-login dance
    /// (spec.md §4.7 step 3) rather than per-request header auth.
    fn uses_cookie_based_login(&self) -> bool {
        false
    }

    /// Form parameters to POST to the login path, if cookie-based login is
    /// in use.
    fn login_parameters_for_site(&self, _site: &str) -> Option<HashMap<String, String>> {
        None
    }

    /// The path to POST login parameters to.
    fn login_path_for_site(&self, _site: &str) -> String {
        "/_session".to_string()
    }
}

/// Authorizer for CouchDB's native cookie-based `_session` login, using a
/// fixed username/password pair.
pub struct CookieAuthorizer {
    username: String,
    password: String,
}

impl CookieAuthorizer {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        CookieAuthorizer {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authorizer for CookieAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_parameters_for_site(&self, _site: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        params.insert("name".to_string(), self.username.clone());
        params.insert("password".to_string(), self.password.clone());
        Some(params)
    }

    fn login_path_for_site(&self, _site: &str) -> String {
        "/_session".to_string()
    }
}

/// Authorizer constructed from a `persona=<assertion>` query parameter found
/// on the remote URL at replication-construction time (spec.md §4.7's
/// "query-string authorizer handling").
pub struct PersonaAuthorizer {
    assertion: String,
}

impl PersonaAuthorizer {
    pub fn new(assertion: impl Into<String>) -> Self {
        PersonaAuthorizer {
            assertion: assertion.into(),
        }
    }
}

impl Authorizer for PersonaAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_parameters_for_site(&self, _site: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        params.insert("assertion".to_string(), self.assertion.clone());
        Some(params)
    }

    fn login_path_for_site(&self, _site: &str) -> String {
        "/_persona_assertion".to_string()
    }
}

/// Authorizer constructed from `facebookAccessToken=<token>&email=<email>`
/// query parameters. Access tokens are kept in per-instance state rather
/// than the process-wide static map the Java source used (spec.md §9's
/// "static global access-token map" redesign flag) — this avoids leaking
/// tokens across unrelated `Authorizer` instances.
pub struct FacebookAuthorizer {
    email: String,
    tokens: Mutex<HashMap<String, String>>,
}

impl FacebookAuthorizer {
    pub fn new(email: impl Into<String>, access_token: impl Into<String>) -> Arc<Self> {
        let email = email.into();
        let mut tokens = HashMap::new();
        tokens.insert(email.clone(), access_token.into());
        Arc::new(FacebookAuthorizer {
            email,
            tokens: Mutex::new(tokens),
        })
    }

    pub fn set_access_token(&self, origin: &str, token: impl Into<String>) {
        self.tokens.lock().unwrap().insert(origin.to_string(), token.into());
    }
}

impl Authorizer for FacebookAuthorizer {
    fn uses_cookie_based_login(&self) -> bool {
        true
    }

    fn login_parameters_for_site(&self, site: &str) -> Option<HashMap<String, String>> {
        let tokens = self.tokens.lock().unwrap();
        let token = tokens.get(site).or_else(|| tokens.get(&self.email))?;
        let mut params = HashMap::new();
        params.insert("access_token".to_string(), token.clone());
        params.insert("email".to_string(), self.email.clone());
        Some(params)
    }

    fn login_path_for_site(&self, _site: &str) -> String {
        "/_facebook_login".to_string()
    }
}

/// Parsed query-string authorizer credentials found on a remote URL, along
/// with the URL stripped of those parameters (spec.md §4.7).
pub struct UrlAuthorizer {
    pub authorizer: Arc<dyn Authorizer>,
    pub stripped_url: String,
}

/// Inspects `url` for `persona=` or `facebookAccessToken=&email=` query
/// parameters and, if found, builds the matching authorizer and returns the
/// url with its query string removed.
pub fn authorizer_from_query_string(url: &str) -> Option<UrlAuthorizer> {
    let (base, query) = url.split_once('?')?;
    let params: HashMap<String, String> = query
        .split('&')
        .filter_map(|kv| {
            let mut it = kv.splitn(2, '=');
            let k = it.next()?;
            let v = it.next().unwrap_or("");
            Some((
                urlencoding_decode(k),
                urlencoding_decode(v),
            ))
        })
        .collect();

    if let Some(assertion) = params.get("persona") {
        return Some(UrlAuthorizer {
            authorizer: Arc::new(PersonaAuthorizer::new(assertion.clone())),
            stripped_url: base.to_string(),
        });
    }

    if let (Some(token), Some(email)) = (params.get("facebookAccessToken"), params.get("email")) {
        return Some(UrlAuthorizer {
            authorizer: FacebookAuthorizer::new(email.clone(), token.clone()),
            stripped_url: base.to_string(),
        });
    }

    None
}

fn urlencoding_decode(s: &str) -> String {
    percent_decode(s.as_bytes())
}

fn percent_decode(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persona_query_param_is_stripped_and_parsed() {
        let result =
            authorizer_from_query_string("https://example.com/db?persona=abc123").unwrap();
        assert_eq!(result.stripped_url, "https://example.com/db");
        assert!(result.authorizer.uses_cookie_based_login());
    }

    #[test]
    fn facebook_query_params_are_stripped_and_parsed() {
        let result = authorizer_from_query_string(
            "https://example.com/db?facebookAccessToken=tok&email=a%40b.com",
        )
        .unwrap();
        assert_eq!(result.stripped_url, "https://example.com/db");
        let params = result
            .authorizer
            .login_parameters_for_site("a@b.com")
            .unwrap();
        assert_eq!(params.get("email").unwrap(), "a@b.com");
    }

    #[test]
    fn plain_url_yields_no_authorizer() {
        assert!(authorizer_from_query_string("https://example.com/db").is_none());
    }
}
