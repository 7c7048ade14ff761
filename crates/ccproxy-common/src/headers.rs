/// Ordered header list. Names compare case-insensitively; insertion order is
/// preserved so provider fingerprint overlays keep their original ordering.
pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

/// Push without replacing; used for headers that may repeat
/// (e.g. `X-Model-Warning`).
pub fn header_append(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    headers.push((name.into(), value.into()));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers: Headers = vec![("Content-Type".into(), "text/plain".into())];
        header_set(&mut headers, "content-type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn append_keeps_duplicates() {
        let mut headers: Headers = Vec::new();
        header_append(&mut headers, "x-model-warning", "a");
        header_append(&mut headers, "x-model-warning", "b");
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn remove_returns_value() {
        let mut headers: Headers = vec![("Authorization".into(), "Bearer t".into())];
        assert_eq!(header_remove(&mut headers, "authorization").as_deref(), Some("Bearer t"));
        assert!(headers.is_empty());
    }
}
