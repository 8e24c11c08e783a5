//! Label extraction from bracketed key predicates in schema paths.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

/// Pulls key predicates out of a prefix path.
///
/// `/interfaces/interface[name='lo0']/state/` becomes labels
/// `{"name": "lo0"}` with the prefix rewritten to
/// `/interfaces/interface/state/`. Surrounding single quotes are stripped
/// from values.
pub(crate) fn extract_labels(prefix: &str) -> (BTreeMap<String, String>, String) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(/[^/]*)\[([A-Za-z0-9\-/]*=[^\[]*)\]").expect("static regex"));

    let mut labels = BTreeMap::new();
    let mut rewritten = prefix.to_owned();

    for caps in re.captures_iter(prefix) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let elem = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let predicate = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        if let Some((key, value)) = predicate.split_once('=') {
            labels.insert(key.to_owned(), value.replace('\'', ""));
        }

        rewritten = rewritten.replacen(whole, elem, 1);
    }

    (labels, rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_predicate() {
        let (labels, prefix) =
            extract_labels("/interfaces/interface[name='lo0']/state/counters/");
        assert_eq!(labels.len(), 1);
        assert_eq!(labels["name"], "lo0");
        assert_eq!(prefix, "/interfaces/interface/state/counters/");
    }

    #[test]
    fn multiple_predicates_across_elements() {
        let (labels, prefix) = extract_labels(
            "/network-instances/network-instance[instance='master']/protocols/protocol[id='bgp']/",
        );
        assert_eq!(labels["instance"], "master");
        assert_eq!(labels["id"], "bgp");
        assert_eq!(
            prefix,
            "/network-instances/network-instance/protocols/protocol/"
        );
    }

    #[test]
    fn plain_prefix_is_untouched() {
        let (labels, prefix) = extract_labels("/interfaces/interface/");
        assert!(labels.is_empty());
        assert_eq!(prefix, "/interfaces/interface/");
    }
}
