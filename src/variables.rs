use crate::{*, error::*, value::*};
use std::collections::HashMap;
use bitflags::*;

// Virtual memory for named variables: each name maps to a growable byte image holding everything written for it.
// Aggregates whose length is only discovered while reading (e.g. a linked list walked node by node) are ingested with
// append writes, which also remember where in target memory each element came from.

// Offset sentinel for set_variable(): write at the current end of the image and record a new element.
pub const APPEND: i64 = -1;

bitflags! { pub struct VariableFlags: u8 {
    // Survives clear_non_const(). For one-shot reads, e.g. configuration values that can't change while the program runs.
    const CONST = 0x1;
    // Had at least one append write, so `elements` describes it.
    const ARRAY = 0x2;
}}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementInfo {
    pub offset: usize, // in the image
    pub size: usize, // including virtual-size padding
    pub target_base: usize, // address in target memory the element was read from
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrideHint {
    Unknown,
    Uniform(usize),
    // Two elements had different sizes. Never goes back to Uniform until the variable is cleared.
    Mixed,
}

pub struct Variable {
    pub image: Vec<u8>,
    pub flags: VariableFlags,
    pub elements: Vec<ElementInfo>,
    pub stride: StrideHint,
}

impl Variable {
    fn new() -> Self { Self {image: Vec::new(), flags: VariableFlags::empty(), elements: Vec::new(), stride: StrideHint::Unknown} }

    // Index of the appended element whose bytes contain `offset`.
    pub fn element_at(&self, offset: usize) -> Option<usize> {
        let idx = self.elements.partition_point(|e| e.offset <= offset);
        if idx == 0 {
            return None;
        }
        let e = &self.elements[idx - 1];
        if offset < e.offset + e.size {Some(idx - 1)} else {None}
    }
}

pub struct VariableStore {
    vars: HashMap<String, Variable>,
}

impl VariableStore {
    pub fn new() -> Self { Self {vars: HashMap::new()} }

    pub fn len(&self) -> usize { self.vars.len() }
    pub fn contains(&self, name: &str) -> bool { self.vars.contains_key(name) }
    pub fn get(&self, name: &str) -> Option<&Variable> { self.vars.get(name) }
    pub fn is_const(&self, name: &str) -> bool { self.vars.get(name).map_or(false, |v| v.flags.contains(VariableFlags::CONST)) }
    pub fn variable_len(&self, name: &str) -> Option<usize> { self.vars.get(name).map(|v| v.image.len()) }

    // Writes `size` bytes of `value` at `offset` (or at the end, if offset is APPEND), zero-padded up to `virtual_size`.
    // Once a variable was written as const, it stays const.
    pub fn set_variable(&mut self, name: &str, size: usize, value: &InputValue, offset: i64, target_base: Option<usize>, virtual_size: Option<usize>, is_const: bool) -> Result<()> {
        let append = offset == APPEND;
        if offset < 0 && !append {
            return err!(Usage, "bad offset {} for {}", offset, name);
        }
        let total = size.max(virtual_size.unwrap_or(0));
        if total == 0 {
            return err!(Usage, "empty write to {}", name);
        }
        let pos = match self.vars.get(name) {
            _ if !append => usize::try_from(offset)?,
            Some(v) => v.image.len(),
            None => 0,
        };
        let end = match pos.checked_add(total) {
            Some(e) => e,
            None => return err!(Usage, "write to {} at {} + {} overflows", name, pos, total),
        };

        let var = self.vars.entry(name.to_string()).or_insert_with(Variable::new);
        if is_const {
            var.flags.insert(VariableFlags::CONST);
        }
        if var.image.len() < end {
            var.image.resize(end, 0);
        }
        var.image[pos..pos + size].copy_from_slice(&value.encode(size, None));
        var.image[pos + size..end].fill(0);

        if append {
            var.flags.insert(VariableFlags::ARRAY);
            var.elements.push(ElementInfo {offset: pos, size: total, target_base: target_base.unwrap_or(0)});
            var.stride = match var.stride {
                StrideHint::Unknown => StrideHint::Uniform(total),
                StrideHint::Uniform(s) if s == total => StrideHint::Uniform(s),
                _ => StrideHint::Mixed,
            };
        }
        Ok(())
    }

    pub fn read_value(&self, r: &Ref) -> Result<DecodedValue> {
        let (offset, width) = r.span()?;
        let var = match self.vars.get(&r.name) {
            Some(v) => v,
            None => return err!(NoVariable, "no variable {}", r.name),
        };
        if offset + width > var.image.len() {
            return err!(OutOfBounds, "{}[{}..{}] is out of bounds ({} bytes)", r.name, offset, offset + width, var.image.len());
        }
        Ok(decode(&var.image[offset..offset + width], r.kind))
    }

    // Only the written span changes. The image grows if needed (gap before the span, if any, reads as zeros).
    pub fn write_value(&mut self, r: &Ref, value: &InputValue, virtual_size: Option<usize>) -> Result<()> {
        let (offset, width) = r.span()?;
        let n = width.max(virtual_size.unwrap_or(0));
        let end = match offset.checked_add(n) {
            Some(e) => e,
            None => return err!(Usage, "write to {} at {} + {} overflows", r.name, offset, n),
        };
        // Encoded at the ref's own width (an f32 stays an f32), then zero-padded to the virtual size.
        let mut bytes = value.encode(width, r.kind);
        bytes.resize(n, 0);
        let var = self.vars.entry(r.name.clone()).or_insert_with(Variable::new);
        if var.image.len() < end {
            var.image.resize(end, 0);
        }
        var.image[offset..end].copy_from_slice(&bytes);
        Ok(())
    }

    // Up to `size` bytes starting at r.offset; shorter (possibly empty) if the image ends first. r.width is ignored.
    pub fn read_raw(&self, r: &Ref, size: usize) -> Result<Vec<u8>> {
        if r.offset < 0 {
            return err!(Usage, "negative offset {} in {}", r.offset, r.name);
        }
        let var = match self.vars.get(&r.name) {
            Some(v) => v,
            None => return err!(NoVariable, "no variable {}", r.name),
        };
        let start = usize::try_from(r.offset)?.min(var.image.len());
        let end = start.saturating_add(size).min(var.image.len());
        Ok(var.image[start..end].to_vec())
    }

    // A variable that never had an append write is a scalar (or a fixed-layout struct): one element.
    pub fn get_array_element_count(&self, name: &str) -> usize {
        match self.vars.get(name) {
            Some(v) if !v.elements.is_empty() => v.elements.len(),
            _ => 1,
        }
    }

    pub fn get_element_target_base(&self, name: &str, index: usize) -> Option<usize> {
        Some(self.vars.get(name)?.elements.get(index)?.target_base)
    }

    pub fn element(&self, name: &str, index: usize) -> Option<ElementInfo> {
        self.vars.get(name)?.elements.get(index).copied()
    }

    pub fn stride(&self, name: &str) -> Option<usize> {
        match self.vars.get(name)?.stride {
            StrideHint::Uniform(s) => Some(s),
            _ => None,
        }
    }

    // Target address of the byte at r.offset, via the origin of the appended element containing it.
    // Works for structs embedded at a fixed offset inside a bigger appended record too.
    pub fn target_address_of(&self, r: &Ref) -> Option<usize> {
        let offset = usize::try_from(r.offset).ok()?;
        let var = self.vars.get(&r.name)?;
        let e = &var.elements[var.element_at(offset)?];
        e.target_base.checked_add(offset - e.offset)
    }

    pub fn clear_non_const(&mut self) {
        self.vars.retain(|_, v| v.flags.contains(VariableFlags::CONST));
    }

    pub fn remove(&mut self, name: &str) -> bool { self.vars.remove(name).is_some() }

    pub fn clear(&mut self) { self.vars.clear(); }
}
