use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Combination mode of an edge: a bitmask of independent flags.
///
/// Serialized as a list of lowercase flag names, e.g. `["multi", "buffer"]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Vec<ModeFlag>", into = "Vec<ModeFlag>")]
pub struct Mode(u8);

impl Mode {
    /// Latest value only, edge considered in isolation.
    pub const NONE: Mode = Mode(0);
    /// Join across every MULTI edge feeding the same input slot.
    pub const MULTI: Mode = Mode(0b001);
    /// Keep every emission instead of only the latest.
    pub const BUFFER: Mode = Mode(0b010);
    /// Pair positionally with the other ZIP edges of the destination.
    pub const ZIP: Mode = Mode(0b100);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Mode) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn flags(self) -> Vec<ModeFlag> {
        [ModeFlag::Multi, ModeFlag::Buffer, ModeFlag::Zip]
            .into_iter()
            .filter(|f| self.contains(Mode::from(*f)))
            .collect()
    }
}

impl BitOr for Mode {
    type Output = Mode;

    fn bitor(self, rhs: Mode) -> Mode {
        Mode(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mode {
    fn bitor_assign(&mut self, rhs: Mode) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("Mode(NONE)");
        }
        let names: Vec<&str> = self.flags().iter().map(|f| f.as_str()).collect();
        write!(f, "Mode({})", names.join(" | "))
    }
}

/// A single serialized mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeFlag {
    Multi,
    Buffer,
    Zip,
}

impl ModeFlag {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Multi => "MULTI",
            Self::Buffer => "BUFFER",
            Self::Zip => "ZIP",
        }
    }
}

impl From<ModeFlag> for Mode {
    fn from(flag: ModeFlag) -> Self {
        match flag {
            ModeFlag::Multi => Mode::MULTI,
            ModeFlag::Buffer => Mode::BUFFER,
            ModeFlag::Zip => Mode::ZIP,
        }
    }
}

impl From<Vec<ModeFlag>> for Mode {
    fn from(flags: Vec<ModeFlag>) -> Self {
        flags
            .into_iter()
            .fold(Mode::NONE, |acc, f| acc | Mode::from(f))
    }
}

impl From<Mode> for Vec<ModeFlag> {
    fn from(mode: Mode) -> Self {
        mode.flags()
    }
}

/// One side of an edge: a node id and one of its slot names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub node: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl<N: Into<String>, P: Into<String>> From<(N, P)> for Endpoint {
    fn from((node, port): (N, P)) -> Self {
        Self::new(node, port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// A directed connection from one node's output slot to another's input slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from: Endpoint,
    pub to: Endpoint,
    #[serde(default)]
    pub mode: Mode,
}

impl Edge {
    /// Create a plain latest-value edge.
    pub fn new(id: impl Into<String>, from: impl Into<Endpoint>, to: impl Into<Endpoint>) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            mode: Mode::NONE,
        }
    }

    /// Set the combination mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Whether the destination receives an array rather than a single value.
    pub fn delivers_array(&self) -> bool {
        !self.mode.contains(Mode::ZIP)
            && (self.mode.contains(Mode::BUFFER) || self.mode.contains(Mode::MULTI))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mode_bit_ops() {
        let mode = Mode::MULTI | Mode::BUFFER;
        assert!(mode.contains(Mode::MULTI));
        assert!(mode.contains(Mode::BUFFER));
        assert!(!mode.contains(Mode::ZIP));
        assert_eq!(mode.bits(), 0b011);
        assert!(Mode::NONE.is_empty());
        assert_eq!(format!("{:?}", mode), "Mode(MULTI | BUFFER)");
    }

    #[test]
    fn test_mode_serde_as_flag_list() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "from": {"node": "a", "port": "out"},
            "to": {"node": "b", "port": "items"},
            "mode": ["buffer", "multi"]
        }))
        .unwrap();
        assert_eq!(edge.mode, Mode::MULTI | Mode::BUFFER);
        assert_eq!(
            serde_json::to_value(edge.mode).unwrap(),
            json!(["multi", "buffer"])
        );
    }

    #[test]
    fn test_mode_defaults_to_none() {
        let edge: Edge = serde_json::from_value(json!({
            "id": "e1",
            "from": {"node": "a", "port": "out"},
            "to": {"node": "b", "port": "in"}
        }))
        .unwrap();
        assert!(edge.mode.is_empty());
        assert!(!edge.delivers_array());
    }

    #[test]
    fn test_zip_edge_delivers_single_values() {
        let edge = Edge::new("e", ("a", "out"), ("b", "left")).with_mode(Mode::ZIP | Mode::BUFFER);
        assert!(!edge.delivers_array());
        let edge = Edge::new("e", ("a", "out"), ("b", "left")).with_mode(Mode::BUFFER);
        assert!(edge.delivers_array());
    }
}
