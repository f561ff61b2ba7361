// Copyright 2024 Gravitational, Inc
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{length_width, put_length, put_tag, tag_width, StringEncoding, MAX_VALUE_LENGTH};
use crate::errors::{unexpected_encoding, unsupported_length, TlvError, TlvErrorKind, TlvResult};
use byteorder::ByteOrder;
use std::ops::{Deref, DerefMut};
use zeroize::Zeroize;

#[derive(Debug)]
enum Node {
    Leaf { tag: u32, value: Vec<u8> },
    Nested { tag: u32, children: Vec<Node> },
    // Pre-encoded TLV appended verbatim via write_encoded.
    Raw(Vec<u8>),
}

#[derive(Debug)]
struct Scope {
    tag: u32,
    children: Vec<Node>,
}

/// Assembles a TLV tree in memory; lengths are computed at serialization
/// time so elements can be appended in any order within a scope.
///
/// Values copied into the writer are wiped when the writer is cleared or
/// dropped, so it is safe to route key-derived material through it.
#[derive(Default, Debug)]
pub struct Writer {
    nodes: Vec<Node>,
    stack: Vec<Scope>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a nested TLV with the given tag. The returned scope derefs to
    /// the writer, so values can be appended through it; the scope is closed
    /// when the handle is dropped (or explicitly via [`NestedScope::close`]),
    /// on every exit path.
    pub fn open_nested(&mut self, tag: u32) -> TlvResult<NestedScope<'_>> {
        tag_width(tag)?;
        self.stack.push(Scope {
            tag,
            children: Vec::new(),
        });
        Ok(NestedScope {
            writer: self,
            done: false,
        })
    }

    /// Appends a leaf TLV under the currently open scope (or at the root).
    pub fn write_value(&mut self, tag: u32, value: &[u8]) -> TlvResult<()> {
        tag_width(tag)?;
        length_width(value.len())?;
        self.append(Node::Leaf {
            tag,
            value: value.to_vec(),
        });
        Ok(())
    }

    pub fn write_byte(&mut self, tag: u32, value: u8) -> TlvResult<()> {
        self.write_value(tag, &[value])
    }

    pub fn write_i16<E: ByteOrder>(&mut self, tag: u32, value: i16) -> TlvResult<()> {
        let mut buf = [0u8; 2];
        E::write_i16(&mut buf, value);
        self.write_value(tag, &buf)
    }

    pub fn write_i32<E: ByteOrder>(&mut self, tag: u32, value: i32) -> TlvResult<()> {
        let mut buf = [0u8; 4];
        E::write_i32(&mut buf, value);
        self.write_value(tag, &buf)
    }

    pub fn write_string(&mut self, tag: u32, text: &str, encoding: StringEncoding) -> TlvResult<()> {
        if encoding == StringEncoding::Ascii && !text.is_ascii() {
            return Err(unexpected_encoding(format!("{text:?} is not ASCII")));
        }
        self.write_value(tag, text.as_bytes())
    }

    /// Appends an already-encoded TLV verbatim, bypassing tag and length
    /// re-encoding.
    pub fn write_encoded(&mut self, raw: &[u8]) -> TlvResult<()> {
        self.append(Node::Raw(raw.to_vec()));
        Ok(())
    }

    /// Total serialized length of the tree. Only valid once every opened
    /// scope has been closed.
    pub fn encoded_length(&self) -> TlvResult<usize> {
        if !self.stack.is_empty() {
            return Err(TlvError::new(
                TlvErrorKind::InvalidSchema,
                format!("{} nested scope(s) still open", self.stack.len()),
            ));
        }
        let mut total = 0;
        for node in &self.nodes {
            total += node_encoded_length(node)?;
        }
        Ok(total)
    }

    /// Serializes the whole tree into a fresh buffer.
    pub fn encode(&self) -> TlvResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.encoded_length()?);
        for node in &self.nodes {
            encode_node(node, &mut out)?;
        }
        Ok(out)
    }

    /// Serializes into a caller-provided buffer. Returns `None` (and writes
    /// nothing) when the buffer is too small.
    pub fn try_encode(&self, dest: &mut [u8]) -> TlvResult<Option<usize>> {
        let len = self.encoded_length()?;
        if dest.len() < len {
            return Ok(None);
        }
        let mut buf = self.encode()?;
        dest[..len].copy_from_slice(&buf);
        buf.zeroize();
        Ok(Some(len))
    }

    /// Wipes every value byte copied into the writer and resets it.
    pub fn clear(&mut self) {
        zeroize_nodes(&mut self.nodes);
        for scope in &mut self.stack {
            zeroize_nodes(&mut scope.children);
        }
        self.stack.clear();
    }

    fn append(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(scope) => scope.children.push(node),
            None => self.nodes.push(node),
        }
    }

    fn end_nested(&mut self) {
        if let Some(scope) = self.stack.pop() {
            self.append(Node::Nested {
                tag: scope.tag,
                children: scope.children,
            });
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Handle for an open nested TLV; closes the scope on drop.
#[derive(Debug)]
pub struct NestedScope<'a> {
    writer: &'a mut Writer,
    done: bool,
}

impl NestedScope<'_> {
    /// Closes the scope now instead of at end of block.
    pub fn close(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if !self.done {
            self.done = true;
            self.writer.end_nested();
        }
    }
}

impl Drop for NestedScope<'_> {
    fn drop(&mut self) {
        self.end();
    }
}

impl Deref for NestedScope<'_> {
    type Target = Writer;

    fn deref(&self) -> &Writer {
        self.writer
    }
}

impl DerefMut for NestedScope<'_> {
    fn deref_mut(&mut self) -> &mut Writer {
        self.writer
    }
}

fn node_encoded_length(node: &Node) -> TlvResult<usize> {
    match node {
        Node::Leaf { tag, value } => {
            Ok(tag_width(*tag)? + length_width(value.len())? + value.len())
        }
        Node::Nested { tag, children } => {
            let mut inner = 0;
            for child in children {
                inner += node_encoded_length(child)?;
            }
            if inner > MAX_VALUE_LENGTH {
                return Err(unsupported_length(format!(
                    "nested value length {inner:#x} out of range"
                )));
            }
            Ok(tag_width(*tag)? + length_width(inner)? + inner)
        }
        Node::Raw(raw) => Ok(raw.len()),
    }
}

fn encode_node(node: &Node, out: &mut Vec<u8>) -> TlvResult<()> {
    match node {
        Node::Leaf { tag, value } => {
            put_tag(out, *tag);
            put_length(out, value.len());
            out.extend_from_slice(value);
        }
        Node::Nested { tag, children } => {
            let mut inner = 0;
            for child in children {
                inner += node_encoded_length(child)?;
            }
            if inner > MAX_VALUE_LENGTH {
                return Err(unsupported_length(format!(
                    "nested value length {inner:#x} out of range"
                )));
            }
            put_tag(out, *tag);
            put_length(out, inner);
            for child in children {
                encode_node(child, out)?;
            }
        }
        Node::Raw(raw) => out.extend_from_slice(raw),
    }
    Ok(())
}

fn zeroize_nodes(nodes: &mut Vec<Node>) {
    for node in nodes.iter_mut() {
        match node {
            Node::Leaf { value, .. } => value.zeroize(),
            Node::Nested { children, .. } => zeroize_nodes(children),
            Node::Raw(raw) => raw.zeroize(),
        }
    }
    nodes.clear();
}
