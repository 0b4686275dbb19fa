use crate::grammar::GrammarError;
use crate::symbol::{Symbol, TerminalValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Child indices from the root down to a node. The empty path is the root.
pub type TreePath = Vec<usize>;

/// A concrete expansion of a symbol.
///
/// Children are owned exclusively. `sources` holds the trees a value
/// generator consumed to produce this node; they are kept for export and
/// inspection but never rendered, counted or searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationTree {
    symbol: Symbol,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<DerivationTree>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sources: Vec<DerivationTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recipient: Option<String>,
    #[serde(default)]
    read_only: bool,
}

/// One message of a protocol run, in tree order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub sender: String,
    pub recipient: Option<String>,
    pub symbol: Symbol,
    pub payload: Vec<u8>,
    pub path: TreePath,
}

/// A complex number parsed from a rendered tree, e.g. `1.5-2j`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: f64,
    pub im: f64,
}

impl DerivationTree {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            children: Vec::new(),
            sources: Vec::new(),
            sender: None,
            recipient: None,
            read_only: false,
        }
    }

    pub fn terminal(value: TerminalValue) -> Self {
        Self::new(Symbol::Terminal(value))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new(Symbol::text(value))
    }

    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::new(Symbol::bytes(value))
    }

    pub fn non_terminal(name: impl AsRef<str>, children: Vec<DerivationTree>) -> Self {
        Self {
            children,
            ..Self::new(Symbol::non_terminal(name))
        }
    }

    pub fn with_party(mut self, sender: Option<String>, recipient: Option<String>) -> Self {
        self.sender = sender;
        self.recipient = recipient;
        self
    }

    pub fn with_sources(mut self, sources: Vec<DerivationTree>) -> Self {
        self.sources = sources;
        self
    }

    /// Marks the node and all of its descendants as produced by a generator.
    pub fn into_read_only(mut self) -> Self {
        self.mark_read_only();
        self
    }

    fn mark_read_only(&mut self) {
        self.read_only = true;
        for child in &mut self.children {
            child.mark_read_only();
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn children(&self) -> &[DerivationTree] {
        &self.children
    }

    pub fn sources(&self) -> &[DerivationTree] {
        &self.sources
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn extend_children(&mut self, children: impl IntoIterator<Item = DerivationTree>) {
        self.children.extend(children);
    }

    /// Clears party annotations below the outermost annotated nodes.
    pub(crate) fn strip_nested_parties(&mut self) {
        fn clear(node: &mut DerivationTree, inside: bool) {
            if inside {
                node.sender = None;
                node.recipient = None;
            }
            let inside = inside || node.sender.is_some();
            for child in &mut node.children {
                clear(child, inside);
            }
        }
        clear(self, false);
    }

    /// Number of nodes, sources excluded.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(DerivationTree::size).sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(DerivationTree::depth)
            .max()
            .unwrap_or(0)
    }

    /// Left-to-right concatenation of all terminal leaves.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_bytes(&mut out);
        out
    }

    fn write_bytes(&self, out: &mut Vec<u8>) {
        if let Symbol::Terminal(value) = &self.symbol {
            out.extend_from_slice(value.as_bytes());
        }
        for child in &self.children {
            child.write_bytes(out);
        }
    }

    /// True if any leaf is a byte terminal rather than text.
    pub fn contains_bytes(&self) -> bool {
        matches!(&self.symbol, Symbol::Terminal(v) if v.is_bytes())
            || self.children.iter().any(DerivationTree::contains_bytes)
    }

    pub fn to_int(&self) -> Option<i64> {
        self.to_string().trim().parse().ok()
    }

    pub fn to_float(&self) -> Option<f64> {
        self.to_string().trim().parse().ok()
    }

    pub fn to_complex(&self) -> Option<Complex> {
        parse_complex(self.to_string().trim())
    }

    pub fn get(&self, path: &[usize]) -> Option<&DerivationTree> {
        path.iter()
            .try_fold(self, |node, idx| node.children.get(*idx))
    }

    pub fn get_mut(&mut self, path: &[usize]) -> Option<&mut DerivationTree> {
        path.iter()
            .try_fold(self, |node, idx| node.children.get_mut(*idx))
    }

    /// Swaps the subtree at `path` for `replacement` and returns the old one.
    ///
    /// The replacement must carry the same symbol, so the parent's child
    /// sequence stays derivable. The slot keeps its sender and recipient.
    pub fn replace_at(
        &mut self,
        path: &[usize],
        mut replacement: DerivationTree,
    ) -> Result<DerivationTree, GrammarError> {
        let slot = self.get_mut(path).ok_or_else(|| GrammarError::Validity {
            path: path.to_vec(),
            symbol: replacement.symbol.to_string(),
            reason: "no node at path".into(),
        })?;
        if slot.symbol != replacement.symbol {
            return Err(GrammarError::Validity {
                path: path.to_vec(),
                symbol: replacement.symbol.to_string(),
                reason: format!("slot holds {}", slot.symbol),
            });
        }
        replacement.sender = slot.sender.clone();
        replacement.recipient = slot.recipient.clone();
        Ok(std::mem::replace(slot, replacement))
    }

    /// Visits every node in pre-order together with its path.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&TreePath, &'a DerivationTree)) {
        let mut path = Vec::new();
        self.walk_at(&mut path, visit);
    }

    fn walk_at<'a>(
        &'a self,
        path: &mut TreePath,
        visit: &mut dyn FnMut(&TreePath, &'a DerivationTree),
    ) {
        visit(path, self);
        for (idx, child) in self.children.iter().enumerate() {
            path.push(idx);
            child.walk_at(path, visit);
            path.pop();
        }
    }

    /// Paths of all nodes carrying `symbol`, in pre-order.
    pub fn find_all(&self, symbol: &Symbol) -> Vec<TreePath> {
        let mut found = Vec::new();
        self.walk(&mut |path, node| {
            if node.symbol == *symbol {
                found.push(path.clone());
            }
        });
        found
    }

    pub fn count(&self, symbol: &Symbol) -> usize {
        let own = usize::from(self.symbol == *symbol);
        own + self.children.iter().map(|c| c.count(symbol)).sum::<usize>()
    }

    /// Paths of all non-terminal nodes, root included.
    pub fn non_terminal_paths(&self) -> Vec<TreePath> {
        let mut found = Vec::new();
        self.walk(&mut |path, node| {
            if node.symbol.is_non_terminal() {
                found.push(path.clone());
            }
        });
        found
    }

    /// Outermost sender-annotated nodes, in order.
    pub fn protocol_msgs(&self) -> Vec<ProtocolMessage> {
        let mut out = Vec::new();
        let mut path = Vec::new();
        self.collect_msgs(&mut path, &mut out);
        out
    }

    fn collect_msgs(&self, path: &mut TreePath, out: &mut Vec<ProtocolMessage>) {
        if let Some(sender) = &self.sender {
            out.push(ProtocolMessage {
                sender: sender.clone(),
                recipient: self.recipient.clone(),
                symbol: self.symbol.clone(),
                payload: self.to_bytes(),
                path: path.clone(),
            });
            return;
        }
        for (idx, child) in self.children.iter().enumerate() {
            path.push(idx);
            child.collect_msgs(path, out);
            path.pop();
        }
    }

    /// MD5 digest of the tree shape and leaf values. Two trees with the same
    /// rendering but different derivations hash differently.
    pub fn structural_hash(&self) -> [u8; 16] {
        let mut buf = Vec::with_capacity(self.size() * 8);
        self.encode_shape(&mut buf);
        md5::compute(&buf).0
    }

    fn encode_shape(&self, buf: &mut Vec<u8>) {
        match &self.symbol {
            Symbol::Terminal(TerminalValue::Text(s)) => {
                buf.push(b'T');
                buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            Symbol::Terminal(TerminalValue::Bytes(b)) => {
                buf.push(b'B');
                buf.extend_from_slice(&(b.len() as u64).to_le_bytes());
                buf.extend_from_slice(b);
            }
            Symbol::NonTerminal(name) => {
                buf.push(b'N');
                buf.extend_from_slice(&(name.len() as u64).to_le_bytes());
                buf.extend_from_slice(name.as_bytes());
            }
            Symbol::Slice => buf.push(b'S'),
        }
        buf.extend_from_slice(&(self.children.len() as u64).to_le_bytes());
        for child in &self.children {
            child.encode_shape(buf);
        }
    }
}

impl fmt::Display for DerivationTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_bytes()))
    }
}

fn parse_complex(s: &str) -> Option<Complex> {
    if let Ok(re) = s.parse::<f64>() {
        return Some(Complex { re, im: 0.0 });
    }
    let body = s.strip_suffix(['j', 'i'])?;
    // Split at the last sign that is not part of an exponent.
    let split = body
        .char_indices()
        .rev()
        .find(|(idx, c)| {
            (*c == '+' || *c == '-')
                && *idx > 0
                && !matches!(body[..*idx].chars().last(), Some('e' | 'E'))
        })
        .map(|(idx, _)| idx);
    match split {
        Some(idx) => {
            let re = body[..idx].parse().ok()?;
            let im_text = &body[idx..];
            let im = match im_text {
                "+" => 1.0,
                "-" => -1.0,
                t => t.parse().ok()?,
            };
            Some(Complex { re, im })
        }
        None => {
            let im = match body {
                "" | "+" => 1.0,
                "-" => -1.0,
                t => t.parse().ok()?,
            };
            Some(Complex { re: 0.0, im })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn greeting() -> DerivationTree {
        DerivationTree::non_terminal(
            "start",
            vec![
                DerivationTree::non_terminal("word", vec![DerivationTree::text("hi")])
                    .with_party(Some("Client".into()), Some("Server".into())),
                DerivationTree::text(" "),
                DerivationTree::non_terminal("word", vec![DerivationTree::bytes(b"42".to_vec())])
                    .with_party(Some("Server".into()), None),
            ],
        )
    }

    #[test]
    fn rendering_concatenates_leaves_left_to_right() {
        let tree = greeting();
        assert_eq!(tree.to_bytes(), b"hi 42".to_vec());
        assert_eq!(tree.to_string(), "hi 42");
        assert!(tree.contains_bytes(), "The second word is a byte terminal");
        assert_eq!(tree.size(), 6);
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn numeric_coercions_parse_rendered_value() {
        let number = DerivationTree::non_terminal("n", vec![DerivationTree::text(" 17 ")]);
        assert_eq!(number.to_int(), Some(17));
        assert_eq!(number.to_float(), Some(17.0));
        assert_eq!(
            DerivationTree::text("1.5-2j").to_complex(),
            Some(Complex { re: 1.5, im: -2.0 })
        );
        assert_eq!(
            DerivationTree::text("3j").to_complex(),
            Some(Complex { re: 0.0, im: 3.0 })
        );
        assert_eq!(DerivationTree::text("abc").to_int(), None);
    }

    #[test]
    fn protocol_msgs_lists_outermost_annotated_nodes() {
        let msgs = greeting().protocol_msgs();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].sender, "Client");
        assert_eq!(msgs[0].recipient.as_deref(), Some("Server"));
        assert_eq!(msgs[0].payload, b"hi".to_vec());
        assert_eq!(msgs[1].path, vec![2]);
        assert_eq!(msgs[1].recipient, None);
    }

    #[test]
    fn replace_at_requires_matching_symbol_and_keeps_slot_parties() {
        let mut tree = greeting();
        let replacement = DerivationTree::non_terminal("word", vec![DerivationTree::text("yo")]);
        let old = tree
            .replace_at(&[0], replacement)
            .expect("same symbol should be accepted");
        assert_eq!(old.to_string(), "hi");
        assert_eq!(tree.to_string(), "yo 42");
        assert_eq!(tree.get(&[0]).and_then(|n| n.sender()), Some("Client"));

        let wrong = DerivationTree::non_terminal("other", vec![]);
        assert!(
            tree.replace_at(&[0], wrong).is_err(),
            "A different symbol must be rejected"
        );
        assert!(tree.replace_at(&[9], DerivationTree::text("x")).is_err());
    }

    #[test]
    fn find_all_and_count_ignore_sources() {
        let word = Symbol::non_terminal("word");
        let tree = greeting();
        assert_eq!(tree.find_all(&word), vec![vec![0], vec![2]]);

        let with_sources = DerivationTree::non_terminal("wrap", vec![tree.clone()])
            .with_sources(vec![tree.clone()]);
        assert_eq!(with_sources.count(&word), 2);
        assert_eq!(with_sources.size(), tree.size() + 1);
    }

    #[test]
    fn structural_hash_separates_derivations_with_equal_rendering() {
        let flat = DerivationTree::non_terminal(
            "s",
            vec![DerivationTree::text("a"), DerivationTree::text("b")],
        );
        let nested = DerivationTree::non_terminal(
            "s",
            vec![DerivationTree::non_terminal(
                "s",
                vec![DerivationTree::text("a"), DerivationTree::text("b")],
            )],
        );
        assert_eq!(flat.to_string(), nested.to_string());
        assert_ne!(flat.structural_hash(), nested.structural_hash());
        assert_eq!(flat.structural_hash(), flat.clone().structural_hash());
    }

    fn arb_tree() -> impl Strategy<Value = DerivationTree> {
        let leaf = "[a-z]{0,3}".prop_map(DerivationTree::text);
        leaf.prop_recursive(4, 32, 4, |inner| {
            (prop::sample::select(vec!["x", "y"]), prop::collection::vec(inner, 0..4))
                .prop_map(|(name, children)| DerivationTree::non_terminal(name, children))
        })
    }

    proptest! {
        #[test]
        fn every_path_from_find_all_resolves(tree in arb_tree()) {
            for name in ["x", "y"] {
                let symbol = Symbol::non_terminal(name);
                let paths = tree.find_all(&symbol);
                prop_assert_eq!(paths.len(), tree.count(&symbol));
                for path in paths {
                    prop_assert_eq!(tree.get(&path).map(|n| n.symbol()), Some(&symbol));
                }
            }
        }

        #[test]
        fn serde_export_preserves_rendering(tree in arb_tree()) {
            let json = serde_json::to_string(&tree).expect("trees serialize");
            let back: DerivationTree = serde_json::from_str(&json).expect("trees deserialize");
            prop_assert_eq!(back.to_string(), tree.to_string());
            prop_assert_eq!(back.structural_hash(), tree.structural_hash());
        }
    }
}
