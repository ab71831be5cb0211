use serde::{Deserialize, Serialize};

/// Account details resolved for a chat customer, used to cross-check coupon usage
/// recorded through other sales channels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    pub account_id: Option<String>,
    pub email: Option<String>,
}

impl CustomerIdentity {
    /// True when `usage_entry` refers to this customer's account id or email.
    pub fn matches_usage_entry(&self, usage_entry: &str) -> bool {
        let entry = usage_entry.trim();
        if entry.is_empty() {
            return false;
        }

        let by_account = self.account_id.as_deref().is_some_and(|account| account == entry);
        let by_email =
            self.email.as_deref().is_some_and(|email| email.trim().eq_ignore_ascii_case(entry));
        by_account || by_email
    }
}
