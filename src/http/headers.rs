//! Header fields as an ordered list with case-insensitive names.

/// Header fields in wire order.
///
/// Names compare case-insensitively. A name may appear more than once;
/// [`set`](Headers::set) collapses it back to a single entry.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/plain");
/// headers.set("content-type", "text/html");
///
/// assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
/// assert_eq!(headers.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping earlier ones with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Replaces every field named `name` with one carrying `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.fields.retain(|(field, _)| !field.eq_ignore_ascii_case(&name));
        self.fields.push((name, value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of fields, counting repeated names separately.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(n, v)| (n.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_case_insensitively() {
        let headers: Headers = [("Cache-Control", "max-age=60")].into_iter().collect();
        assert_eq!(headers.get("cache-control"), Some("max-age=60"));
        assert!(headers.contains("CACHE-CONTROL"));
        assert!(!headers.contains("etag"));
    }

    #[test]
    fn insert_keeps_repeats_in_order() {
        let mut headers = Headers::new();
        headers.insert("X-Layer", "outer");
        headers.insert("x-layer", "inner");
        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(fields, vec![("X-Layer", "outer"), ("x-layer", "inner")]);
        assert_eq!(headers.get("X-LAYER"), Some("outer"));
    }

    #[test]
    fn set_collapses_repeats() {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "text/plain");
        headers.insert("content-type", "text/css");
        headers.set("Content-Type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type"), Some("application/json"));
    }
}
