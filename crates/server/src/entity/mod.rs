//! SeaORM entities backing the Consent Store and the bundled protocol engine.

pub mod authorization_code;
pub mod consent_preconfiguration;
pub mod consent_session;
pub mod device_code_session;
pub mod pushed_authorization_request;
pub mod user_opaque_identifier;

/// Join a list of scopes/audiences into the normalized storage form.
///
/// Entries are deduplicated and sorted so that equal sets always produce the
/// same string; exact-match lookups rely on this.
pub fn join_set<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut items: Vec<String> = items
        .into_iter()
        .map(|s| s.as_ref().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    items.sort();
    items.dedup();
    items.join(" ")
}

/// Split a space-separated storage column back into its entries.
pub fn split_set(value: &str) -> Vec<String> {
    value.split_whitespace().map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_set_is_order_independent() {
        assert_eq!(
            join_set(["profile", "openid", "profile"]),
            join_set(["openid", "profile"])
        );
        assert_eq!(join_set(["openid", " ", "email"]), "email openid");
    }

    #[test]
    fn split_set_ignores_extra_whitespace() {
        assert_eq!(split_set(" openid  email "), vec!["openid", "email"]);
        assert!(split_set("").is_empty());
    }
}
