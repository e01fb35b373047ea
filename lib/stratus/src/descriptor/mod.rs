// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration documents handed to the hypervisor management layer.
//!
//! Documents are built as an owned [`Element`] tree and rendered to XML
//! text. Attribute order is insertion order and rendering is deterministic,
//! so two trees built from the same inputs always produce identical text.

use std::fmt::Write;

pub mod domain;

pub use domain::{DescriptorError, DomainDescriptorBuilder};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: Option<String>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attrs.push((key.into(), value.to_string()));
        self
    }

    pub fn text(mut self, text: impl ToString) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children.extend(children);
        self
    }

    /// Shorthand for a child holding only text.
    pub fn leaf(self, name: &str, text: impl ToString) -> Self {
        self.child(Element::new(name).text(text))
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// First direct child with the given name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Every element reached by following a `/`-separated path of child
    /// names, in document order.
    pub fn find_all(&self, path: &str) -> Vec<&Element> {
        let mut current = vec![self];
        for step in path.split('/').filter(|s| !s.is_empty()) {
            current = current
                .into_iter()
                .flat_map(|e| e.children.iter().filter(|c| c.name == step))
                .collect();
        }
        current
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let _ = write!(out, "{indent}<{}", self.name);
        for (key, value) in &self.attrs {
            let _ = write!(out, " {key}=\"{}\"", escape(value));
        }
        match (&self.text, self.children.is_empty()) {
            (None, true) => out.push_str("/>\n"),
            (Some(text), true) => {
                let _ = writeln!(out, ">{}</{}>", escape(text), self.name);
            }
            (text, false) => {
                out.push_str(">\n");
                if let Some(text) = text {
                    let _ = writeln!(out, "{indent}  {}", escape(text));
                }
                for child in &self.children {
                    child.render_into(out, depth + 1);
                }
                let _ = writeln!(out, "{indent}</{}>", self.name);
            }
        }
    }
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_nested_elements() {
        let doc = Element::new("domain")
            .attr("type", "kvm")
            .leaf("name", "instance-00000001")
            .child(
                Element::new("devices").child(
                    Element::new("serial")
                        .attr("type", "file")
                        .child(Element::new("source").attr("path", "a&b")),
                ),
            );
        let expected = "<domain type=\"kvm\">
  <name>instance-00000001</name>
  <devices>
    <serial type=\"file\">
      <source path=\"a&amp;b\"/>
    </serial>
  </devices>
</domain>
";
        assert_eq!(doc.render(), expected);
    }

    #[test]
    fn path_lookup_walks_children_in_order() {
        let doc = Element::new("domain").child(
            Element::new("devices")
                .child(Element::new("disk").child(Element::new("source").attr("file", "a")))
                .child(Element::new("interface"))
                .child(Element::new("disk").child(Element::new("source").attr("file", "b"))),
        );
        let sources: Vec<_> = doc
            .find_all("devices/disk/source")
            .into_iter()
            .filter_map(|s| s.get_attr("file"))
            .collect();
        assert_eq!(sources, ["a", "b"]);
        assert!(doc.find_all("devices/console").is_empty());
    }
}
