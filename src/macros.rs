use std::collections::HashMap;

/// The protocol stages macros can be attached to.
///
/// Discriminants are the wire indices used in the negotiate reply's
/// symbol-list tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacroStage {
    Connect = 0,
    Helo = 1,
    Mail = 2,
    Rcpt = 3,
    Data = 4,
    EndOfMessage = 5,
    EndOfHeader = 6,
}

impl MacroStage {
    pub(crate) const ALL: [MacroStage; 7] = [
        MacroStage::Connect,
        MacroStage::Helo,
        MacroStage::Mail,
        MacroStage::Rcpt,
        MacroStage::Data,
        MacroStage::EndOfMessage,
        MacroStage::EndOfHeader,
    ];

    /// Map the command code carried in a define-macro packet to a stage.
    pub(crate) fn from_command_code(code: u8) -> Option<Self> {
        match code {
            b'C' => Some(MacroStage::Connect),
            b'H' => Some(MacroStage::Helo),
            b'M' => Some(MacroStage::Mail),
            b'R' => Some(MacroStage::Rcpt),
            b'T' => Some(MacroStage::Data),
            b'E' => Some(MacroStage::EndOfMessage),
            b'N' => Some(MacroStage::EndOfHeader),
            _ => None,
        }
    }

    pub(crate) fn command_code(self) -> u8 {
        match self {
            MacroStage::Connect => b'C',
            MacroStage::Helo => b'H',
            MacroStage::Mail => b'M',
            MacroStage::Rcpt => b'R',
            MacroStage::Data => b'T',
            MacroStage::EndOfMessage => b'E',
            MacroStage::EndOfHeader => b'N',
        }
    }
}

/// Which macro symbols the filter wants the MTA to send, per stage.
///
/// Carried in the negotiate reply as one `(stage, symbol list)` tuple per
/// non-empty stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroRequests {
    symbols: HashMap<MacroStage, Vec<String>>,
}

impl MacroRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request `symbols` for `stage`, replacing any previous request for
    /// that stage.
    pub fn set_symbols<S: Into<String>>(
        &mut self,
        stage: MacroStage,
        symbols: impl IntoIterator<Item = S>,
    ) {
        self.symbols
            .insert(stage, symbols.into_iter().map(Into::into).collect());
    }

    /// The symbols requested for `stage`, if any.
    pub fn symbols(&self, stage: MacroStage) -> Option<&[String]> {
        self.symbols.get(&stage).map(Vec::as_slice)
    }

    /// Merge `other` into `self`, stage by stage. A stage present in
    /// `other` replaces the list previously held for that stage.
    pub fn merge(&mut self, other: &MacroRequests) {
        for (stage, symbols) in &other.symbols {
            self.symbols.insert(*stage, symbols.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.values().all(Vec::is_empty)
    }

    /// Stages with a non-empty request, in wire-index order. Encoding
    /// iterates this so identical requests yield identical bytes.
    pub(crate) fn iter_wire_order(&self) -> impl Iterator<Item = (MacroStage, &[String])> {
        MacroStage::ALL.iter().filter_map(move |stage| {
            self.symbols
                .get(stage)
                .filter(|symbols| !symbols.is_empty())
                .map(|symbols| (*stage, symbols.as_slice()))
        })
    }
}

/// The macros received from the MTA, grouped by stage.
///
/// A define-macro packet replaces the whole map of its stage, so the
/// symbols visible to a stage handler are exactly the ones sent
/// immediately before that stage's command.
#[derive(Debug, Default)]
pub(crate) struct MacroSet {
    by_stage: HashMap<MacroStage, HashMap<String, String>>,
}

impl MacroSet {
    pub fn define(&mut self, stage: MacroStage, macros: HashMap<String, String>) {
        self.by_stage.insert(stage, macros);
    }

    pub fn stage(&self, stage: MacroStage) -> Option<&HashMap<String, String>> {
        self.by_stage.get(&stage)
    }

    /// Look a symbol up across all stages, most specific stage first.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        MacroStage::ALL
            .iter()
            .rev()
            .filter_map(|stage| self.by_stage.get(stage))
            .filter_map(|map| map.get(name))
            .map(String::as_str)
            .next()
    }

    pub fn clear(&mut self) {
        self.by_stage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn merge_replaces_per_stage_lists() {
        let mut base = MacroRequests::new();
        base.set_symbols(MacroStage::Helo, vec!["G", "N", "U"]);
        base.set_symbols(MacroStage::Mail, vec!["{mail_addr}"]);

        let mut update = MacroRequests::new();
        update.set_symbols(MacroStage::Helo, vec!["{tls_version}"]);

        base.merge(&update);

        assert_eq!(
            base.symbols(MacroStage::Helo),
            Some(&["{tls_version}".to_string()][..])
        );
        assert_eq!(
            base.symbols(MacroStage::Mail),
            Some(&["{mail_addr}".to_string()][..])
        );
    }

    #[test]
    fn wire_order_is_stage_index_order() {
        let mut requests = MacroRequests::new();
        requests.set_symbols(MacroStage::EndOfMessage, vec!["{i}"]);
        requests.set_symbols(MacroStage::Connect, vec!["j", "_"]);

        let stages: Vec<MacroStage> = requests.iter_wire_order().map(|(s, _)| s).collect();

        assert_eq!(stages, vec![MacroStage::Connect, MacroStage::EndOfMessage]);
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn define_supersedes_previous_stage_map() {
        let mut set = MacroSet::default();
        set.define(MacroStage::Mail, map(&[("{mail_addr}", "a@b")]));
        set.define(MacroStage::Mail, map(&[("i", "4Q")]));

        let map = set.stage(MacroStage::Mail).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("i").map(String::as_str), Some("4Q"));
        assert_eq!(set.lookup("{mail_addr}"), None);
    }

    #[test]
    fn lookup_searches_all_stages() {
        let mut set = MacroSet::default();
        set.define(MacroStage::Connect, map(&[("j", "mail.example")]));

        assert_eq!(set.lookup("j"), Some("mail.example"));
        assert_eq!(set.lookup("{nope}"), None);
    }
}
