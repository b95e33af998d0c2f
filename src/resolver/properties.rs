//! Attribute storage for a single URN and the `properties` line format.
//!
//! A properties text holds one triple per line, either fully qualified
//! `SUBJECT ATTRIBUTE=VALUE` or relative `ATTRIBUTE=VALUE`. Values are escaped
//! so a value never spans lines.

use crate::urn;

/// Attribute name to values, in insertion order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UrnObject {
    attributes: Vec<(String, Vec<String>)>,
}

impl UrnObject {
    pub fn get(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(a, _)| a == attribute)
            .map(|(_, v)| v.as_slice())
    }

    fn values_mut(&mut self, attribute: &str) -> &mut Vec<String> {
        match self.attributes.iter().position(|(a, _)| a == attribute) {
            Some(idx) => &mut self.attributes[idx].1,
            None => {
                self.attributes.push((attribute.to_string(), Vec::new()));
                let last = self.attributes.len() - 1;
                &mut self.attributes[last].1
            }
        }
    }

    pub fn set(&mut self, attribute: &str, value: String) {
        let values = self.values_mut(attribute);
        values.clear();
        values.push(value);
    }

    /// Returns false when the value was already present.
    pub fn add(&mut self, attribute: &str, value: String) -> bool {
        let values = self.values_mut(attribute);
        if values.contains(&value) {
            false
        } else {
            values.push(value);
            true
        }
    }

    pub fn delete(&mut self, attribute: &str) {
        self.attributes.retain(|(a, _)| a != attribute);
    }

    pub fn delete_value(&mut self, attribute: &str, value: &str) {
        if let Some((_, values)) = self.attributes.iter_mut().find(|(a, _)| a == attribute) {
            values.retain(|v| v != value);
        }
        self.attributes.retain(|(_, v)| !v.is_empty());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .flat_map(|(a, values)| values.iter().map(move |v| (a.as_str(), v.as_str())))
    }

    /// Persistent pairs only.
    pub fn persistent(&self) -> impl Iterator<Item = (&str, &str)> {
        self.iter().filter(|(a, _)| !urn::is_volatile(a))
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

pub fn format_line(subject: Option<&str>, attribute: &str, value: &str) -> String {
    match subject {
        Some(s) => format!("{} {}={}\n", s, attribute, urn::escape_value(value)),
        None => format!("{}={}\n", attribute, urn::escape_value(value)),
    }
}

/// Split one line into `(subject, attribute, value)`.
///
/// Relative lines take `context` as their subject. Anything else is
/// malformed and yields `None`.
pub fn parse_line(line: &str, context: Option<&str>) -> Option<(String, String, String)> {
    let (head, value) = line.split_once('=')?;

    let (subject, attribute) = match head.trim().split_once(' ') {
        Some((s, a)) => (s.trim().to_string(), a.trim()),
        None => (context?.to_string(), head.trim()),
    };

    if subject.is_empty() || attribute.is_empty() || attribute.contains(' ') {
        return None;
    }
    Some((subject, attribute.to_string(), urn::unescape_value(value)))
}

#[cfg(test)]
mod test_urn_object {
    use super::*;

    #[test]
    fn set_replaces_add_appends() {
        let mut obj = UrnObject::default();
        obj.add("aff4:size", "100".into());
        obj.add("aff4:size", "200".into());
        assert_eq!(obj.get("aff4:size").unwrap(), &["100", "200"]);

        assert!(!obj.add("aff4:size", "100".into()));
        assert_eq!(obj.get("aff4:size").unwrap().len(), 2);

        obj.set("aff4:size", "300".into());
        assert_eq!(obj.get("aff4:size").unwrap(), &["300"]);
    }

    #[test]
    fn insertion_order_and_volatile_filter() {
        let mut obj = UrnObject::default();
        obj.set("aff4:type", "image".into());
        obj.set("aff4volatile:dirty", "1".into());
        obj.add("aff4:contains", "urn:aff4:b".into());
        obj.add("aff4:contains", "urn:aff4:a".into());

        let all: Vec<_> = obj.iter().collect();
        assert_eq!(all.len(), 4);

        let kept: Vec<_> = obj.persistent().collect();
        assert_eq!(
            kept,
            vec![
                ("aff4:type", "image"),
                ("aff4:contains", "urn:aff4:b"),
                ("aff4:contains", "urn:aff4:a")
            ]
        );
    }

    #[test]
    fn delete_value_drops_empty_lists() {
        let mut obj = UrnObject::default();
        obj.add("aff4:contains", "a".into());
        obj.add("aff4:contains", "b".into());

        obj.delete_value("aff4:contains", "a");
        assert_eq!(obj.get("aff4:contains").unwrap(), &["b"]);

        obj.delete_value("aff4:contains", "b");
        assert!(obj.get("aff4:contains").is_none());
        assert!(obj.is_empty());
    }
}

#[cfg(test)]
mod test_lines {
    use super::*;

    #[test]
    fn qualified_line() {
        assert_eq!(
            parse_line("urn:aff4:x aff4:size=100", None),
            Some(("urn:aff4:x".into(), "aff4:size".into(), "100".into()))
        );
    }

    #[test]
    fn relative_line() {
        assert_eq!(
            parse_line("aff4:type=image", Some("urn:aff4:x")),
            Some(("urn:aff4:x".into(), "aff4:type".into(), "image".into()))
        );
        assert_eq!(parse_line("aff4:type=image", None), None);
    }

    #[test]
    fn value_keeps_equals_signs() {
        let (_, _, value) = parse_line("urn:aff4:x aff4:sha256=abc==", None).unwrap();
        assert_eq!(value, "abc==");
    }

    #[test]
    fn malformed_lines() {
        assert_eq!(parse_line("no equals sign", Some("urn:aff4:x")), None);
        assert_eq!(parse_line("=value", Some("urn:aff4:x")), None);
        assert_eq!(parse_line("a b c=value", None), None);
    }

    #[test]
    fn escaped_value_roundtrip() {
        let line = format_line(Some("urn:aff4:m"), "aff4:map_data", "0,0,@\n5,0,urn:aff4:null\n");
        assert_eq!(line.matches('\n').count(), 1);

        let (_, _, value) = parse_line(line.trim_end(), None).unwrap();
        assert_eq!(value, "0,0,@\n5,0,urn:aff4:null\n");
    }
}
