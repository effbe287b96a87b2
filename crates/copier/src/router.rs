use timeseries::Labels;

/// Derives the tenant key for a series. An empty `tenant_label` means
/// single-tenant mode and everything routes to the root key `""`; otherwise
/// the label's value decides, falling back to `default_tenant` when the label
/// is absent or empty.
pub fn tenant_key<'a>(
    labels: &'a Labels,
    tenant_label: &str,
    default_tenant: &'a str,
) -> &'a str {
    if tenant_label.is_empty() {
        return "";
    }
    match labels.get(tenant_label) {
        Some(value) if !value.is_empty() => value,
        _ => default_tenant,
    }
}
