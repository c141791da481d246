//! RFC 8288 `Link` header handling, limited to what pagination needs.

/// Returns the target of the `rel="next"` entry, if any.
/// `<https://acme.okta.com/api/v1/logs?after=1>; rel="next", <...>; rel="self"`
pub(crate) fn next_link<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<String> {
    values
        .into_iter()
        .flat_map(|value| value.split(','))
        .find_map(|entry| {
            let mut parts = entry.split(';');
            let target = parts.next()?.trim();
            let url = target.strip_prefix('<')?.strip_suffix('>')?;
            parts
                .any(|param| is_next_rel(param.trim()))
                .then(|| url.to_string())
        })
}

fn is_next_rel(param: &str) -> bool {
    let Some((name, value)) = param.split_once('=') else {
        return false;
    };
    name.trim().eq_ignore_ascii_case("rel")
        && value
            .trim()
            .trim_matches('"')
            .split_whitespace()
            .any(|rel| rel.eq_ignore_ascii_case("next"))
}
