use multiaddr::Multiaddr;

/// Allow and deny lists consulted before every dial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPolicy {
    allow: Vec<Multiaddr>,
    deny: Vec<Multiaddr>,
}

impl AddressPolicy {
    pub fn new(allow: Vec<Multiaddr>, deny: Vec<Multiaddr>) -> Self {
        AddressPolicy { allow, deny }
    }

    /// A denied match wins, an empty allow list allows everything else.
    pub fn is_allowed(&self, addr: &Multiaddr) -> bool {
        if self.deny.iter().any(|filter| matches(filter, addr)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|filter| matches(filter, addr))
    }
}

/// A filter matches when each of its components occurs somewhere in `addr`.
fn matches(filter: &Multiaddr, addr: &Multiaddr) -> bool {
    filter
        .iter()
        .all(|component| addr.iter().any(|other| other == component))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_allows() {
        assert!(AddressPolicy::default().is_allowed(&addr("/ip4/1.2.3.4/tcp/1")));
    }

    #[test]
    fn test_deny() {
        let policy = AddressPolicy::new(vec![], vec![addr("/ip4/10.0.0.1")]);
        assert!(!policy.is_allowed(&addr("/ip4/10.0.0.1/tcp/4001")));
        assert!(policy.is_allowed(&addr("/ip4/10.0.0.2/tcp/4001")));
    }

    #[test]
    fn test_allow_list() {
        let policy = AddressPolicy::new(vec![addr("/tcp/4001")], vec![addr("/ip4/10.0.0.1")]);
        assert!(policy.is_allowed(&addr("/ip4/10.0.0.2/tcp/4001")));
        assert!(!policy.is_allowed(&addr("/ip4/10.0.0.2/tcp/4002")));
        // deny wins over allow
        assert!(!policy.is_allowed(&addr("/ip4/10.0.0.1/tcp/4001")));
    }
}
