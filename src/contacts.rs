//! Contact list for multi-peer deployments.
//!
//! The host pushes a CSV of known endpoint names; the user cycles through
//! them to pick a call destination. The endpoint's own name is excluded,
//! and the current selection survives list updates when possible.

/// Fallback destination when the host never pushed a contact list.
pub const DEFAULT_CONTACT: &str = "Hub";

pub struct Contacts {
    entries: Vec<String>,
    index: usize,
    own_name: String,
}

impl Contacts {
    pub fn new(own_name: impl Into<String>) -> Self {
        Self {
            entries: vec![DEFAULT_CONTACT.to_string()],
            index: 0,
            own_name: own_name.into(),
        }
    }

    /// Replace the list from a CSV string ("Kitchen, Workshop, Hub").
    /// Whitespace is trimmed, empty names and this device's own name are
    /// dropped, and the previous selection is kept when it still exists.
    pub fn set_csv(&mut self, csv: &str) {
        let previous = self.current().to_string();

        self.entries = csv
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != self.own_name)
            .map(str::to_string)
            .collect();

        if self.entries.is_empty() {
            self.entries.push(DEFAULT_CONTACT.to_string());
        }

        self.index = self
            .entries
            .iter()
            .position(|name| *name == previous)
            .unwrap_or(0);

        tracing::info!(count = self.entries.len(), "contacts updated");
    }

    pub fn next(&mut self) {
        self.index = (self.index + 1) % self.entries.len();
    }

    pub fn prev(&mut self) {
        self.index = (self.index + self.entries.len() - 1) % self.entries.len();
    }

    /// The currently selected call destination.
    pub fn current(&self) -> &str {
        &self.entries[self.index % self.entries.len()]
    }

    pub fn csv(&self) -> String {
        self.entries.join(",")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_hub() {
        let contacts = Contacts::new("Porch");
        assert_eq!(contacts.current(), DEFAULT_CONTACT);
        assert_eq!(contacts.len(), 1);
    }

    #[test]
    fn parses_csv_and_trims() {
        let mut contacts = Contacts::new("Porch");
        contacts.set_csv(" Kitchen , Workshop,Hub ");
        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts.current(), "Kitchen");
        assert_eq!(contacts.csv(), "Kitchen,Workshop,Hub");
    }

    #[test]
    fn excludes_own_name_and_empties() {
        let mut contacts = Contacts::new("Porch");
        contacts.set_csv("Porch,,Kitchen,");
        assert_eq!(contacts.csv(), "Kitchen");
    }

    #[test]
    fn empty_csv_falls_back_to_default() {
        let mut contacts = Contacts::new("Porch");
        contacts.set_csv("");
        assert_eq!(contacts.current(), DEFAULT_CONTACT);
    }

    #[test]
    fn cycles_with_wraparound() {
        let mut contacts = Contacts::new("Porch");
        contacts.set_csv("A,B,C");
        contacts.next();
        assert_eq!(contacts.current(), "B");
        contacts.next();
        contacts.next();
        assert_eq!(contacts.current(), "A");
        contacts.prev();
        assert_eq!(contacts.current(), "C");
    }

    #[test]
    fn selection_survives_list_update() {
        let mut contacts = Contacts::new("Porch");
        contacts.set_csv("A,B,C");
        contacts.next();
        contacts.set_csv("X,B,Y");
        assert_eq!(contacts.current(), "B");

        contacts.set_csv("P,Q");
        assert_eq!(contacts.current(), "P");
    }
}
