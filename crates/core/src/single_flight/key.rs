use std::fmt;

use flightdeck_common::error::{CommonError, CommonResult};
use url::Url;

/// Deterministic identity of an outbound request.
///
/// Two requests map to the same key when they differ only in method case,
/// query parameter order, fragment, or parameter order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Build a key from a method, an absolute URL and extra parameters
    /// (for example a form or JSON body flattened to pairs).
    pub fn new<I, K, V>(method: &str, url: &str, params: I) -> CommonResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let method = method.trim();
        if method.is_empty() {
            return Err(CommonError::validation("method", "must not be empty"));
        }

        let mut parsed = Url::parse(url)
            .map_err(|e| CommonError::validation_with_value("url", e.to_string(), url))?;
        parsed.set_fragment(None);

        let mut query: Vec<(String, String)> =
            parsed.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        query.sort();
        if query.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(&query);
        }

        let mut params: Vec<(String, String)> =
            params.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        params.sort();

        let mut key = format!("{} {}", method.to_ascii_uppercase(), parsed);
        if !params.is_empty() {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&params)
                .finish();
            key.push_str(" | ");
            key.push_str(&encoded);
        }
        Ok(Self(key))
    }

    /// Key with no extra parameters.
    pub fn from_request(method: &str, url: &str) -> CommonResult<Self> {
        Self::new(method, url, std::iter::empty::<(String, String)>())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RequestKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
