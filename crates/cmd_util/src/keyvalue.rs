use anyhow::Context;

/// Split a `key=value` command line argument. The value may itself contain
/// `=`; only the first one separates.
pub fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .with_context(|| format!("invalid key=value: no `=` found in `{s}`"))?;
    anyhow::ensure!(!key.is_empty(), "invalid key=value: empty key in `{s}`");
    Ok((key.to_owned(), value.to_owned()))
}
