// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The rendering surface the binder projects the tree onto.
//!
//! Only the handful of DOM-like primitives the binder needs are modelled.
//! [`MemorySurface`] is an in-memory implementation that renders to markup,
//! used by the tests and the demo.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque handle to an element (or text node) owned by the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementHandle(pub u64);

/// DOM-like output primitives.
pub trait RenderSurface: Send {
    /// Container the tree's root is bound to.
    fn root(&self) -> ElementHandle;
    fn create_element(&mut self, tag: &str) -> ElementHandle;
    fn create_text(&mut self, text: &str) -> ElementHandle;
    /// `None` removes the attribute.
    fn set_attribute(&mut self, element: ElementHandle, name: &str, value: Option<&str>);
    fn set_text(&mut self, element: ElementHandle, text: &str);
    fn append_child(&mut self, parent: ElementHandle, child: ElementHandle);
    fn insert_before(&mut self, parent: ElementHandle, child: ElementHandle, before: ElementHandle);
    fn remove_child(&mut self, parent: ElementHandle, child: ElementHandle);
}

#[derive(Debug, Default)]
struct MemoryElement {
    /// `None` for text nodes.
    tag: Option<String>,
    text: String,
    attributes: BTreeMap<String, String>,
    children: Vec<ElementHandle>,
}

#[derive(Debug, Default)]
struct MemoryDom {
    elements: HashMap<ElementHandle, MemoryElement>,
    next: u64,
    operations: u64,
}

/// Shared in-memory surface; clones observe the same document.
#[derive(Debug, Clone)]
pub struct MemorySurface {
    dom: Arc<Mutex<MemoryDom>>,
}

impl Default for MemorySurface {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySurface {
    const ROOT: ElementHandle = ElementHandle(0);

    #[must_use]
    pub fn new() -> Self {
        let mut dom = MemoryDom {
            next: 1,
            ..MemoryDom::default()
        };
        dom.elements.insert(
            Self::ROOT,
            MemoryElement {
                tag: Some("body".to_string()),
                ..MemoryElement::default()
            },
        );
        Self {
            dom: Arc::new(Mutex::new(dom)),
        }
    }

    /// Markup for everything under the root container (exclusive).
    #[must_use]
    pub fn render(&self) -> String {
        let dom = self.dom.lock();
        let mut out = String::new();
        if let Some(root) = dom.elements.get(&Self::ROOT) {
            for child in &root.children {
                render_into(&dom, *child, &mut out);
            }
        }
        out
    }

    /// Number of mutating calls made on the surface.
    #[must_use]
    pub fn operation_count(&self) -> u64 {
        self.dom.lock().operations
    }

    #[must_use]
    pub fn attribute(&self, element: ElementHandle, name: &str) -> Option<String> {
        self.dom
            .lock()
            .elements
            .get(&element)
            .and_then(|e| e.attributes.get(name).cloned())
    }

    #[must_use]
    pub fn children(&self, element: ElementHandle) -> Vec<ElementHandle> {
        self.dom
            .lock()
            .elements
            .get(&element)
            .map(|e| e.children.clone())
            .unwrap_or_default()
    }

    fn create(&self, tag: Option<&str>, text: &str) -> ElementHandle {
        let mut dom = self.dom.lock();
        dom.operations += 1;
        let handle = ElementHandle(dom.next);
        dom.next += 1;
        dom.elements.insert(
            handle,
            MemoryElement {
                tag: tag.map(str::to_string),
                text: text.to_string(),
                ..MemoryElement::default()
            },
        );
        handle
    }

    fn with_element(&self, element: ElementHandle, f: impl FnOnce(&mut MemoryElement)) {
        let mut dom = self.dom.lock();
        dom.operations += 1;
        if let Some(e) = dom.elements.get_mut(&element) {
            f(e);
        }
    }
}

fn render_into(dom: &MemoryDom, handle: ElementHandle, out: &mut String) {
    let Some(element) = dom.elements.get(&handle) else {
        return;
    };
    let Some(tag) = &element.tag else {
        out.push_str(&element.text);
        return;
    };
    let _ = write!(out, "<{}", tag);
    for (name, value) in &element.attributes {
        let _ = write!(out, " {}=\"{}\"", name, value);
    }
    out.push('>');
    out.push_str(&element.text);
    for child in &element.children {
        render_into(dom, *child, out);
    }
    let _ = write!(out, "</{}>", tag);
}

impl RenderSurface for MemorySurface {
    fn root(&self) -> ElementHandle {
        Self::ROOT
    }

    fn create_element(&mut self, tag: &str) -> ElementHandle {
        self.create(Some(tag), "")
    }

    fn create_text(&mut self, text: &str) -> ElementHandle {
        self.create(None, text)
    }

    fn set_attribute(&mut self, element: ElementHandle, name: &str, value: Option<&str>) {
        self.with_element(element, |e| match value {
            Some(v) => {
                e.attributes.insert(name.to_string(), v.to_string());
            }
            None => {
                e.attributes.remove(name);
            }
        });
    }

    fn set_text(&mut self, element: ElementHandle, text: &str) {
        self.with_element(element, |e| e.text = text.to_string());
    }

    fn append_child(&mut self, parent: ElementHandle, child: ElementHandle) {
        self.with_element(parent, |e| {
            e.children.retain(|c| *c != child);
            e.children.push(child);
        });
    }

    fn insert_before(&mut self, parent: ElementHandle, child: ElementHandle, before: ElementHandle) {
        self.with_element(parent, |e| {
            e.children.retain(|c| *c != child);
            let at = e
                .children
                .iter()
                .position(|c| *c == before)
                .unwrap_or(e.children.len());
            e.children.insert(at, child);
        });
    }

    fn remove_child(&mut self, parent: ElementHandle, child: ElementHandle) {
        self.with_element(parent, |e| e.children.retain(|c| *c != child));
    }
}
