use http::Uri;

/// Combines an upstream base URI with a request target.
///
/// The base supplies scheme, authority and a path prefix; the appended URI
/// supplies the path and an optional query string.
///
/// # Arguments
///
/// * `base` - The upstream base URL, e.g. `http://localhost:8000/api`
/// * `append` - The inbound request target, e.g. `/users?page=1`
///
/// # Examples
///
/// ```
/// use http::Uri;
/// use fleet::utils::combine_uris;
///
/// let base = "http://localhost:8000/api".parse::<Uri>().unwrap();
/// let append = "/users?page=1".parse::<Uri>().unwrap();
/// let combined = combine_uris(&base, &append).unwrap();
/// assert_eq!(combined.to_string(), "http://localhost:8000/api/users?page=1");
/// ```
pub fn combine_uris(base: &Uri, append: &Uri) -> Result<Uri, http::Error> {
    let base_path = base.path().trim_end_matches('/');
    let append_path = append.path().trim_start_matches('/');

    let mut full_path = format!("{}/{}", base_path, append_path);

    if let Some(query) = append.query().filter(|q| !q.is_empty()) {
        full_path.push('?');
        full_path.push_str(query);
    }

    let uri = match (base.scheme_str(), base.authority()) {
        (Some(scheme), Some(authority)) => Uri::builder()
            .scheme(scheme)
            .authority(authority.as_str())
            .path_and_query(full_path)
            .build()?,
        _ => Uri::builder().path_and_query(full_path).build()?,
    };
    Ok(uri)
}
