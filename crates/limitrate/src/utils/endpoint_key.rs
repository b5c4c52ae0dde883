//! Canonical endpoint key construction.
//!
//! An endpoint key is `METHOD|PATH` with the method upper-cased and the
//! route template (placeholders preserved) preferred over the raw path.
//! This function is the only producer of endpoint keys in the crate, so the
//! keys used at enforcement time and at status-inspection time match
//! bit-for-bit.

/// Builds the canonical endpoint key for a request.
///
/// # Examples
///
/// ```rust
/// use limitrate::utils::endpoint_key::endpoint_key;
///
/// assert_eq!(endpoint_key("post", "/api/ask", None), "POST|/api/ask");
/// assert_eq!(
///     endpoint_key("GET", "/users/42", Some("/users/{id}")),
///     "GET|/users/{id}"
/// );
/// ```
pub fn endpoint_key(method: &str, path: &str, route_template: Option<&str>) -> String {
    let path_part = route_template.unwrap_or(path);
    let mut key = String::with_capacity(method.len() + 1 + path_part.len());
    for ch in method.chars() {
        key.push(ch.to_ascii_uppercase());
    }
    key.push('|');
    key.push_str(path_part);
    key
}
