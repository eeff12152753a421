// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Builds device tree blobs for tests.

use super::{FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_MAGIC, FDT_PROP, HEADER_SIZE};

/// Writes a blob in the usual layout: header, empty reservation map, structure block and strings
/// block, optionally with a gap between the last two.
#[derive(Default)]
pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    gap: usize,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder which leaves `gap` unused bytes before the strings block.
    pub fn with_gap(gap: usize) -> Self {
        Self {
            gap,
            ..Self::default()
        }
    }

    /// Builds a blob from the nodes added by `f`.
    pub fn tree(mut self, f: impl FnOnce(&mut Self)) -> Vec<u8> {
        f(&mut self);
        self.finish()
    }

    pub fn begin_node(&mut self, name: &str) {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
    }

    pub fn end_node(&mut self) {
        self.push_u32(FDT_END_NODE);
    }

    pub fn property(&mut self, name: &str, value: &[u8]) {
        let name_offset = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(value.len() as u32);
        self.push_u32(name_offset);
        self.structure.extend_from_slice(value);
        self.pad();
    }

    pub fn property_u32(&mut self, name: &str, value: u32) {
        self.property(name, &value.to_be_bytes());
    }

    pub fn property_string(&mut self, name: &str, value: &str) {
        self.property_stringlist(name, &[value]);
    }

    pub fn property_stringlist(&mut self, name: &str, values: &[&str]) {
        let mut value = Vec::new();
        for entry in values {
            value.extend_from_slice(entry.as_bytes());
            value.push(0);
        }
        self.property(name, &value);
    }

    /// Terminates the structure block and returns the complete blob.
    pub fn finish(mut self) -> Vec<u8> {
        self.push_u32(FDT_END);
        let rsvmap = HEADER_SIZE;
        let off_struct = rsvmap + 16;
        let off_strings = off_struct + self.structure.len() + self.gap;
        let total_size = off_strings + self.strings.len();

        let mut blob = Vec::with_capacity(total_size);
        for word in [
            FDT_MAGIC,
            total_size as u32,
            off_struct as u32,
            off_strings as u32,
            rsvmap as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structure.len() as u32,
        ] {
            blob.extend_from_slice(&word.to_be_bytes());
        }
        blob.resize(off_struct, 0);
        blob.extend_from_slice(&self.structure);
        blob.resize(off_strings, 0);
        blob.extend_from_slice(&self.strings);
        blob
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut offset = 0;
        for existing in self.strings.split(|byte| *byte == 0) {
            if existing == name.as_bytes() && offset < self.strings.len() {
                return offset as u32;
            }
            offset += existing.len() + 1;
        }
        let offset = self.strings.len();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        offset as u32
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }
}
