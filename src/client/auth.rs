use base64::Engine;
use eyre::Result;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Send a bearer token in the Authorization header
    Bearer(String),
    /// Use username and password authentication via Basic Auth headers
    Basic(String, String),
    /// Don't use any authentication
    None,
}

impl Auth {
    /// Read credentials from the environment
    ///
    /// - API_TOKEN: bearer token (takes precedence)
    /// - API_USERNAME / API_PASSWORD: basic auth
    ///
    /// Empty or blank values count as unset.
    pub fn from_env() -> Self {
        if let Some(token) = non_empty_var("API_TOKEN") {
            Self::Bearer(token)
        } else if let (Some(username), Some(password)) =
            (non_empty_var("API_USERNAME"), non_empty_var("API_PASSWORD"))
        {
            Self::Basic(username, password)
        } else {
            Self::None
        }
    }

    /// Add the Authorization header for this auth method, if any
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        match self {
            Self::Bearer(token) => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {}", token))?,
                );
            }
            Self::Basic(username, password) => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Basic {}", credentials))?,
                );
            }
            Self::None => {}
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl std::fmt::Display for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => write!(f, "Bearer"),
            Self::Basic(_, _) => write!(f, "Basic"),
            Self::None => write!(f, "None"),
        }
    }
}
