//! Structural selector language used by the discovery and extraction
//! cascades.
//!
//! Supports the CSS subset the host markup is matched with: type and
//! universal selectors, `#id`, `.class`, attribute presence and
//! `=`/`*=`/`^=` value tests, `:last-child`, and the descendant combinator.

use std::{fmt, str::FromStr};

use crate::{error::SelectorError, tree::HostTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals,
    Contains,
    StartsWith,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrTest {
    name: String,
    op: AttrOp,
    value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
    last_child: bool,
}

/// Parsed selector: compounds joined by descendant combinators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    compounds: Vec<Compound>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        Parser::new(source).parse()
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns `true` when `node` matches, considering all its ancestors.
    pub fn matches<T: HostTree>(&self, tree: &T, node: T::Node) -> bool {
        match self.compounds.len() {
            0 => false,
            len => self.matches_from(tree, node, len - 1),
        }
    }

    fn matches_from<T: HostTree>(&self, tree: &T, node: T::Node, index: usize) -> bool {
        if !compound_matches(tree, node, &self.compounds[index]) {
            return false;
        }
        if index == 0 {
            return true;
        }
        let mut ancestor = tree.parent(node);
        while let Some(candidate) = ancestor {
            if self.matches_from(tree, candidate, index - 1) {
                return true;
            }
            ancestor = tree.parent(candidate);
        }
        false
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(source: &str) -> Result<Self, Self::Err> {
        Self::parse(source)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn compound_matches<T: HostTree>(tree: &T, node: T::Node, compound: &Compound) -> bool {
    if let Some(tag) = &compound.tag {
        if tree.tag_name(node) != *tag {
            return false;
        }
    }
    if let Some(id) = &compound.id {
        if tree.attribute(node, "id").as_deref() != Some(id.as_str()) {
            return false;
        }
    }
    if !compound
        .classes
        .iter()
        .all(|class| tree.has_class(node, class))
    {
        return false;
    }
    for test in &compound.attrs {
        let Some(actual) = tree.attribute(node, &test.name) else {
            return false;
        };
        let ok = match test.op {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == test.value,
            AttrOp::Contains => !test.value.is_empty() && actual.contains(&test.value),
            AttrOp::StartsWith => !test.value.is_empty() && actual.starts_with(&test.value),
        };
        if !ok {
            return false;
        }
    }
    if compound.last_child {
        let is_last = tree
            .parent(node)
            .and_then(|parent| tree.children(parent).last().copied())
            == Some(node);
        if !is_last {
            return false;
        }
    }
    true
}

/// All elements under `scope` (or the whole tree) matching `selector`, in
/// document order. Ancestors outside `scope` still count toward leading
/// compounds.
pub fn query_all<T: HostTree>(tree: &T, scope: Option<T::Node>, selector: &Selector) -> Vec<T::Node> {
    let mut matches = Vec::new();
    let mut pending = match scope {
        Some(scope) => tree.children(scope).into_iter().rev().collect::<Vec<_>>(),
        None => vec![tree.root()],
    };
    while let Some(node) = pending.pop() {
        if selector.matches(tree, node) {
            matches.push(node);
        }
        pending.extend(tree.children(node).into_iter().rev());
    }
    matches
}

pub fn query_first<T: HostTree>(
    tree: &T,
    scope: Option<T::Node>,
    selector: &Selector,
) -> Option<T::Node> {
    // Small trees; a full walk keeps document order trivially correct.
    query_all(tree, scope, selector).into_iter().next()
}

/// Parses a static selector list. Entries that fail to parse are logged and
/// skipped so one bad entry cannot disable a whole cascade.
pub fn parse_cascade(sources: &[&str]) -> Vec<Selector> {
    sources
        .iter()
        .filter_map(|source| match Selector::parse(source) {
            Ok(selector) => Some(selector),
            Err(err) => {
                log::warn!("Skipping invalid selector {:?}: {}", source, err);
                None
            }
        })
        .collect()
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            position: 0,
        }
    }

    fn parse(mut self) -> Result<Selector, SelectorError> {
        let mut compounds = Vec::new();
        self.skip_whitespace();
        while self.peek().is_some() {
            compounds.push(self.compound()?);
            self.skip_whitespace();
        }
        if compounds.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Selector {
            source: self.source.trim().to_string(),
            compounds,
        })
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let mut compound = Compound::default();
        let mut consumed_any = false;
        if self.peek() == Some('*') {
            self.position += 1;
            consumed_any = true;
        } else if self.peek().is_some_and(is_ident_char) {
            compound.tag = Some(self.ident().to_ascii_lowercase());
            consumed_any = true;
        }
        while let Some(c) = self.peek() {
            match c {
                '#' => {
                    self.position += 1;
                    compound.id = Some(self.required_ident()?);
                }
                '.' => {
                    self.position += 1;
                    let class = self.required_ident()?;
                    compound.classes.push(class);
                }
                '[' => compound.attrs.push(self.attribute()?),
                ':' => {
                    self.position += 1;
                    let pseudo = self.required_ident()?;
                    if pseudo != "last-child" {
                        return Err(SelectorError::UnsupportedPseudo(pseudo));
                    }
                    compound.last_child = true;
                }
                c if c.is_whitespace() => break,
                found => {
                    return Err(SelectorError::Unexpected {
                        found,
                        offset: self.offset(),
                    })
                }
            }
            consumed_any = true;
        }
        if !consumed_any {
            return Err(SelectorError::Empty);
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<AttrTest, SelectorError> {
        let start = self.offset();
        self.position += 1;
        self.skip_whitespace();
        let name = self.required_ident()?;
        self.skip_whitespace();
        let op = match self.peek() {
            Some(']') => {
                self.position += 1;
                return Ok(AttrTest {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                });
            }
            Some('=') => {
                self.position += 1;
                AttrOp::Equals
            }
            Some(c @ ('*' | '^')) => {
                self.position += 1;
                self.expect('=')?;
                if c == '*' {
                    AttrOp::Contains
                } else {
                    AttrOp::StartsWith
                }
            }
            Some(found) => {
                return Err(SelectorError::Unexpected {
                    found,
                    offset: self.offset(),
                })
            }
            None => {
                return Err(SelectorError::Unterminated {
                    what: "attribute selector",
                    offset: start,
                })
            }
        };
        self.skip_whitespace();
        let value = match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                let quote_start = self.offset();
                self.position += 1;
                let mut value = String::new();
                loop {
                    match self.peek() {
                        Some(c) if c == quote => {
                            self.position += 1;
                            break;
                        }
                        Some(c) => {
                            value.push(c);
                            self.position += 1;
                        }
                        None => {
                            return Err(SelectorError::Unterminated {
                                what: "string",
                                offset: quote_start,
                            })
                        }
                    }
                }
                value
            }
            _ => self.required_ident()?,
        };
        self.skip_whitespace();
        match self.peek() {
            Some(']') => {
                self.position += 1;
                Ok(AttrTest { name, op, value })
            }
            _ => Err(SelectorError::Unterminated {
                what: "attribute selector",
                offset: start,
            }),
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), SelectorError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.position += 1;
                Ok(())
            }
            Some(found) => Err(SelectorError::Unexpected {
                found,
                offset: self.offset(),
            }),
            None => Err(SelectorError::Unterminated {
                what: "attribute selector",
                offset: self.offset(),
            }),
        }
    }

    fn required_ident(&mut self) -> Result<String, SelectorError> {
        match self.peek() {
            Some(c) if is_ident_char(c) => Ok(self.ident()),
            Some(found) => Err(SelectorError::Unexpected {
                found,
                offset: self.offset(),
            }),
            None => Err(SelectorError::Unterminated {
                what: "identifier",
                offset: self.offset(),
            }),
        }
    }

    fn ident(&mut self) -> String {
        let mut ident = String::new();
        while let Some(c) = self.peek().filter(|c| is_ident_char(*c)) {
            ident.push(c);
            self.position += 1;
        }
        ident
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.position)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.source.len())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::{parse_cascade, query_all, Selector};
    use crate::{
        document::{DocumentTree, ElementSpec},
        error::SelectorError,
        tree::HostTree,
    };

    fn page() -> DocumentTree {
        DocumentTree::new(
            &ElementSpec::new("body").child(
                ElementSpec::new("ytd-playlist-panel-renderer")
                    .id("playlist")
                    .class("style-scope ytd-watch-flexy")
                    .child(
                        ElementSpec::new("div").id("items").children([
                            ElementSpec::new("ytd-playlist-video-renderer").child(
                                ElementSpec::new("a")
                                    .id("video-title")
                                    .attr("href", "/watch?v=1")
                                    .text("One"),
                            ),
                            ElementSpec::new("ytd-playlist-video-renderer").child(
                                ElementSpec::new("div").id("metadata-line").children([
                                    ElementSpec::new("span").text("10 views"),
                                    ElementSpec::new("span").text("2 days ago"),
                                ]),
                            ),
                        ]),
                    ),
            ),
        )
    }

    #[test]
    fn test_descendant_selector_matches_in_document_order() {
        let tree = page();
        let selector = Selector::parse("ytd-playlist-panel-renderer#playlist ytd-playlist-video-renderer")
            .expect("valid selector");
        let matches = query_all(&tree, None, &selector);
        assert_eq!(matches.len(), 2);
        assert_eq!(tree.tag_name(matches[0]), "ytd-playlist-video-renderer");
    }

    #[test]
    fn test_attribute_operators() {
        let tree = page();
        for (source, expected) in [
            ("a[href*=\"watch\"]", 1),
            ("a[href^='/watch']", 1),
            ("[id=\"video-title\"]", 1),
            ("[class*=\"ytd-watch\"] a", 1),
            ("a[href*=\"shorts\"]", 0),
            ("[href]", 1),
        ] {
            let selector = Selector::parse(source).expect("valid selector");
            assert_eq!(query_all(&tree, None, &selector).len(), expected, "{}", source);
        }
    }

    #[test]
    fn test_last_child_and_scoped_query() {
        let tree = page();
        let items = query_all(
            &tree,
            None,
            &Selector::parse("ytd-playlist-video-renderer").expect("valid"),
        );
        let span = query_all(
            &tree,
            Some(items[1]),
            &Selector::parse("#metadata-line span:last-child").expect("valid"),
        );
        assert_eq!(span.len(), 1);
        assert_eq!(tree.text_content(span[0]), "2 days ago");

        // Scope restricts results to descendants but ancestors still match.
        let scoped = query_all(
            &tree,
            Some(items[0]),
            &Selector::parse(".ytd-watch-flexy a").expect("valid"),
        );
        assert_eq!(scoped.len(), 1);
    }

    #[test]
    fn test_class_selector_requires_whole_token() {
        let tree = page();
        let selector = Selector::parse(".ytd-watch").expect("valid");
        assert!(query_all(&tree, None, &selector).is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Selector::parse("   "), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("a[href"),
            Err(SelectorError::Unterminated { .. })
        ));
        assert_eq!(
            Selector::parse("li:hover"),
            Err(SelectorError::UnsupportedPseudo("hover".to_string()))
        );
        assert!(matches!(
            Selector::parse("a > b"),
            Err(SelectorError::Unexpected { found: '>', .. })
        ));
    }

    #[test]
    fn test_parse_cascade_skips_invalid_entries() {
        let cascade = parse_cascade(&["a", "b[", "c"]);
        let sources: Vec<&str> = cascade.iter().map(Selector::as_str).collect();
        assert_eq!(sources, vec!["a", "c"]);
    }
}
