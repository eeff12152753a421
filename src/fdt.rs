// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! In-place editing of flattened device tree blobs.
//!
//! [`Fdt`] works on a blob inside a caller-provided working buffer, growing the structure and
//! strings blocks into the free space at the end of the buffer. Node offsets are relative to the
//! start of the structure block and are invalidated by any edit before them.

#[cfg(test)]
pub mod builder;
pub mod fixup;

use core::ops::Range;
use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, byteorder::big_endian::U32,
};

const FDT_MAGIC: u32 = 0xd00d_feed;
/// The version this editor writes, and the newest it reads.
const FDT_VERSION: u32 = 17;
/// The oldest version a version 17 blob is compatible with, and the oldest this editor reads.
const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Size of a tag word.
const TAG_SIZE: usize = 4;
/// Size of a property tag with its length and name offset.
const PROP_HEADER_SIZE: usize = 12;
/// Size of one memory reservation entry.
const RESERVE_ENTRY_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FdtError {
    #[error("Bad FDT magic")]
    BadMagic,
    #[error("Unsupported FDT version")]
    BadVersion,
    #[error("Malformed FDT structure block")]
    BadStructure,
    #[error("FDT blocks overlap or are out of order")]
    BadLayout,
    #[error("FDT is truncated")]
    Truncated,
    #[error("Not enough space in the FDT working buffer")]
    NoSpace,
    #[error("FDT node or property not found")]
    NotFound,
    #[error("FDT node already exists")]
    Exists,
    #[error("Offset is not the start of an FDT node")]
    BadOffset,
    #[error("Invalid FDT node name")]
    InvalidName,
}

#[derive(Clone, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned)]
#[repr(C)]
struct FdtHeader {
    magic: U32,
    totalsize: U32,
    off_dt_struct: U32,
    off_dt_strings: U32,
    off_mem_rsvmap: U32,
    version: U32,
    last_comp_version: U32,
    boot_cpuid_phys: U32,
    size_dt_strings: U32,
    size_dt_struct: U32,
}

const HEADER_SIZE: usize = size_of::<FdtHeader>();

/// A structure block token.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Tag {
    BeginNode,
    EndNode,
    Prop,
    Nop,
    End,
}

/// Validates the header of the blob at the start of `blob`, returning its total size.
pub fn check_header(blob: &[u8]) -> Result<usize, FdtError> {
    let (header, _) = FdtHeader::ref_from_prefix(blob).map_err(|_| FdtError::Truncated)?;
    if header.magic.get() != FDT_MAGIC {
        return Err(FdtError::BadMagic);
    }
    let version = header.version.get();
    if version < FDT_LAST_COMP_VERSION || header.last_comp_version.get() > FDT_VERSION {
        return Err(FdtError::BadVersion);
    }
    // Version 16 headers don't record the structure block size.
    let struct_size = if version >= FDT_VERSION {
        header.size_dt_struct.get()
    } else {
        0
    };
    let total_size = header.totalsize.get() as usize;
    if total_size > blob.len() {
        return Err(FdtError::Truncated);
    }
    let blocks = [
        (header.off_mem_rsvmap.get(), 0),
        (header.off_dt_struct.get(), struct_size),
        (header.off_dt_strings.get(), header.size_dt_strings.get()),
    ];
    for (offset, size) in blocks {
        let (offset, size) = (offset as usize, size as usize);
        if offset < HEADER_SIZE || offset.checked_add(size).is_none_or(|end| end > total_size) {
            return Err(FdtError::BadLayout);
        }
    }
    Ok(total_size)
}

const fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// A device tree blob open for editing.
pub struct Fdt<'a> {
    buf: &'a mut [u8],
}

impl<'a> Fdt<'a> {
    /// Opens the blob at the start of `buf` for editing, using all of `buf` as working space.
    ///
    /// The blocks are compacted in place and the header's total size set to the buffer length.
    pub fn open_into(buf: &'a mut [u8]) -> Result<Self, FdtError> {
        check_header(buf)?;
        let mut fdt = Self { buf };
        if fdt.header().version.get() < FDT_VERSION {
            fdt.measure_struct_block()?;
        }

        let rsvmap = fdt.header().off_mem_rsvmap.get() as usize;
        let rsvmap_end = rsvmap + fdt.reserve_map_size(rsvmap)?;
        let struct_range = fdt.struct_range();
        let strings_range = fdt.strings_range();
        if rsvmap_end > struct_range.start || struct_range.end > strings_range.start {
            return Err(FdtError::BadLayout);
        }

        let new_struct = align4(rsvmap_end);
        fdt.buf.copy_within(struct_range.clone(), new_struct);
        let new_strings = new_struct + struct_range.len();
        fdt.buf.copy_within(strings_range, new_strings);

        let total_size = u32::try_from(fdt.buf.len()).map_err(|_| FdtError::NoSpace)?;
        let header = fdt.header_mut();
        header.off_dt_struct.set(new_struct as u32);
        header.off_dt_strings.set(new_strings as u32);
        header.totalsize.set(total_size);
        header.version.set(FDT_VERSION);
        header.last_comp_version.set(FDT_LAST_COMP_VERSION);
        Ok(fdt)
    }

    /// Records the size of a version 16 structure block in the header, by walking it up to its
    /// end tag.
    fn measure_struct_block(&mut self) -> Result<(), FdtError> {
        let start = self.header().off_dt_struct.get() as usize;
        let limit = self.total_size() - start;
        self.header_mut().size_dt_struct.set(limit as u32);
        let mut offset = 0;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            offset = next;
            if tag == Tag::End {
                break;
            }
        }
        self.header_mut().size_dt_struct.set(offset as u32);
        Ok(())
    }

    fn header(&self) -> &FdtHeader {
        // The header was validated when the blob was opened and the buffer never shrinks.
        FdtHeader::ref_from_prefix(self.buf)
            .map(|(header, _)| header)
            .unwrap_or_else(|_| unreachable!())
    }

    fn header_mut(&mut self) -> &mut FdtHeader {
        FdtHeader::mut_from_prefix(self.buf)
            .map(|(header, _)| header)
            .unwrap_or_else(|_| unreachable!())
    }

    /// Returns the size of the memory reservation map including its terminating entry.
    fn reserve_map_size(&self, start: usize) -> Result<usize, FdtError> {
        let mut offset = start;
        loop {
            let entry = self
                .buf
                .get(offset..offset + RESERVE_ENTRY_SIZE)
                .ok_or(FdtError::Truncated)?;
            offset += RESERVE_ENTRY_SIZE;
            if entry.iter().all(|byte| *byte == 0) {
                return Ok(offset - start);
            }
        }
    }

    fn struct_range(&self) -> Range<usize> {
        let header = self.header();
        let start = header.off_dt_struct.get() as usize;
        start..start + header.size_dt_struct.get() as usize
    }

    fn strings_range(&self) -> Range<usize> {
        let header = self.header();
        let start = header.off_dt_strings.get() as usize;
        start..start + header.size_dt_strings.get() as usize
    }

    /// Returns the current total size of the blob, as recorded in its header.
    pub fn total_size(&self) -> usize {
        self.header().totalsize.get() as usize
    }

    /// Shrinks the blob's total size to the end of its data, dropping the unused working space.
    pub fn pack(&mut self) -> Result<(), FdtError> {
        let struct_range = self.struct_range();
        let strings_range = self.strings_range();
        if struct_range.end > strings_range.start || strings_range.end > self.buf.len() {
            return Err(FdtError::BadLayout);
        }
        self.header_mut().totalsize.set(strings_range.end as u32);
        Ok(())
    }

    fn struct_block(&self) -> &[u8] {
        &self.buf[self.struct_range()]
    }

    fn read_u32(&self, offset: usize) -> Result<u32, FdtError> {
        let bytes = self
            .struct_block()
            .get(offset..offset + 4)
            .ok_or(FdtError::Truncated)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Decodes the tag at `offset`, returning it and the offset of the following tag.
    fn next_tag(&self, offset: usize) -> Result<(Tag, usize), FdtError> {
        if offset % 4 != 0 {
            return Err(FdtError::BadOffset);
        }
        let (tag, next) = match self.read_u32(offset)? {
            FDT_BEGIN_NODE => {
                let name = self.node_name(offset)?;
                (Tag::BeginNode, align4(offset + TAG_SIZE + name.len() + 1))
            }
            FDT_PROP => {
                let len = self.read_u32(offset + 4)? as usize;
                (Tag::Prop, align4(offset + PROP_HEADER_SIZE + len))
            }
            FDT_END_NODE => (Tag::EndNode, offset + TAG_SIZE),
            FDT_NOP => (Tag::Nop, offset + TAG_SIZE),
            FDT_END => (Tag::End, offset + TAG_SIZE),
            _ => return Err(FdtError::BadStructure),
        };
        if next > self.struct_block().len() {
            return Err(FdtError::Truncated);
        }
        Ok((tag, next))
    }

    /// Returns the next tag at or after `offset` which isn't a NOP.
    fn skip_nops(&self, mut offset: usize) -> Result<(Tag, usize, usize), FdtError> {
        loop {
            let (tag, next) = self.next_tag(offset)?;
            if tag != Tag::Nop {
                return Ok((tag, offset, next));
            }
            offset = next;
        }
    }

    fn check_node(&self, node: usize) -> Result<(), FdtError> {
        match self.next_tag(node) {
            Ok((Tag::BeginNode, _)) => Ok(()),
            _ => Err(FdtError::BadOffset),
        }
    }

    /// Returns the name of the node at `node`, including any unit address.
    pub fn node_name(&self, node: usize) -> Result<&[u8], FdtError> {
        let rest = self
            .struct_block()
            .get(node + TAG_SIZE..)
            .ok_or(FdtError::Truncated)?;
        let len = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FdtError::Truncated)?;
        Ok(&rest[..len])
    }

    /// Returns the offset of the root node.
    pub fn root(&self) -> Result<usize, FdtError> {
        match self.skip_nops(0)? {
            (Tag::BeginNode, offset, _) => Ok(offset),
            _ => Err(FdtError::BadStructure),
        }
    }

    /// Returns the offset just past the properties of `node`, where its first child (or its end)
    /// starts.
    fn end_of_properties(&self, node: usize) -> Result<usize, FdtError> {
        self.check_node(node)?;
        let (_, mut offset) = self.next_tag(node)?;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            match tag {
                Tag::Prop | Tag::Nop => offset = next,
                _ => return Ok(offset),
            }
        }
    }

    /// Returns the offset just past the end tag of `node`.
    fn end_of_node(&self, node: usize) -> Result<usize, FdtError> {
        self.check_node(node)?;
        let mut depth = 0usize;
        let mut offset = node;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            match tag {
                Tag::BeginNode => depth += 1,
                Tag::EndNode => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(next);
                    }
                }
                Tag::End => return Err(FdtError::BadStructure),
                Tag::Prop | Tag::Nop => {}
            }
            offset = next;
        }
    }

    /// Returns the first child of `node`, if any.
    pub fn first_subnode(&self, node: usize) -> Result<Option<usize>, FdtError> {
        let offset = self.end_of_properties(node)?;
        self.subnode_at(offset)
    }

    /// Returns the sibling following `node`, if any.
    pub fn next_subnode(&self, node: usize) -> Result<Option<usize>, FdtError> {
        let offset = self.end_of_node(node)?;
        self.subnode_at(offset)
    }

    fn subnode_at(&self, offset: usize) -> Result<Option<usize>, FdtError> {
        match self.skip_nops(offset)? {
            (Tag::BeginNode, offset, _) => Ok(Some(offset)),
            (Tag::EndNode, _, _) => Ok(None),
            _ => Err(FdtError::BadStructure),
        }
    }

    /// Returns an iterator over the children of `node`.
    pub fn subnodes(&self, node: usize) -> Subnodes<'_, 'a> {
        Subnodes {
            fdt: self,
            next: self.first_subnode(node),
        }
    }

    /// Finds the child of `parent` with the given name.
    ///
    /// If `name` has no unit address then a child with any unit address matches.
    pub fn subnode_offset(&self, parent: usize, name: &str) -> Result<usize, FdtError> {
        for child in self.subnodes(parent) {
            let child = child?;
            if name_matches(self.node_name(child)?, name.as_bytes()) {
                return Ok(child);
            }
        }
        Err(FdtError::NotFound)
    }

    /// Finds the node with the given absolute path.
    pub fn path_offset(&self, path: &str) -> Result<usize, FdtError> {
        let relative = path.strip_prefix('/').ok_or(FdtError::NotFound)?;
        relative
            .split('/')
            .filter(|component| !component.is_empty())
            .try_fold(self.root()?, |node, component| {
                self.subnode_offset(node, component)
            })
    }

    /// Finds the first node, in structure order, whose `compatible` list contains `compatible`.
    pub fn node_offset_by_compatible(&self, compatible: &str) -> Result<usize, FdtError> {
        let mut offset = 0;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            match tag {
                Tag::BeginNode => {
                    if let Ok(value) = self.property(offset, "compatible")
                        && value
                            .split(|byte| *byte == 0)
                            .any(|entry| entry == compatible.as_bytes())
                    {
                        return Ok(offset);
                    }
                }
                Tag::End => return Err(FdtError::NotFound),
                _ => {}
            }
            offset = next;
        }
    }

    /// Returns the offset of the property tag for `name` directly in `node`, if any.
    fn property_offset(&self, node: usize, name: &str) -> Result<Option<usize>, FdtError> {
        self.check_node(node)?;
        let (_, mut offset) = self.next_tag(node)?;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            match tag {
                Tag::Prop => {
                    let name_offset = self.read_u32(offset + 8)? as usize;
                    if self.string_at(name_offset)? == name.as_bytes() {
                        return Ok(Some(offset));
                    }
                }
                Tag::Nop => {}
                _ => return Ok(None),
            }
            offset = next;
        }
    }

    /// Returns the value of the property `name` of `node`.
    pub fn property(&self, node: usize, name: &str) -> Result<&[u8], FdtError> {
        let offset = self
            .property_offset(node, name)?
            .ok_or(FdtError::NotFound)?;
        let len = self.read_u32(offset + 4)? as usize;
        let start = offset + PROP_HEADER_SIZE;
        self.struct_block()
            .get(start..start + len)
            .ok_or(FdtError::Truncated)
    }

    fn property_u32(&self, node: usize, name: &str) -> Result<Option<u32>, FdtError> {
        match self.property(node, name) {
            Ok(value) => {
                let cell: [u8; 4] = value.try_into().map_err(|_| FdtError::BadStructure)?;
                Ok(Some(u32::from_be_bytes(cell)))
            }
            Err(FdtError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the `#address-cells` of `node`, defaulting to 2.
    pub fn address_cells(&self, node: usize) -> Result<u32, FdtError> {
        Ok(self.property_u32(node, "#address-cells")?.unwrap_or(2))
    }

    /// Returns the `#size-cells` of `node`, defaulting to 1.
    pub fn size_cells(&self, node: usize) -> Result<u32, FdtError> {
        Ok(self.property_u32(node, "#size-cells")?.unwrap_or(1))
    }

    /// Returns the NUL-terminated string at `offset` in the strings block, without its terminator.
    fn string_at(&self, offset: usize) -> Result<&[u8], FdtError> {
        let strings = &self.buf[self.strings_range()];
        let rest = strings.get(offset..).ok_or(FdtError::BadStructure)?;
        let len = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(FdtError::BadStructure)?;
        Ok(&rest[..len])
    }

    /// Returns the offset of `name` in the strings block, appending it if it isn't there yet.
    fn find_add_string(&mut self, name: &str) -> Result<u32, FdtError> {
        let strings_range = self.strings_range();
        let strings = &self.buf[strings_range.clone()];
        let len = name.len() + 1;
        if let Some(offset) = strings.windows(len).position(|window| {
            window[..name.len()] == *name.as_bytes() && window[name.len()] == 0
        }) {
            return Ok(offset as u32);
        }

        let end = strings_range.end + len;
        if end > self.buf.len() {
            return Err(FdtError::NoSpace);
        }
        self.buf[strings_range.end..end - 1].copy_from_slice(name.as_bytes());
        self.buf[end - 1] = 0;
        let header = self.header_mut();
        header.size_dt_strings.set((strings_range.len() + len) as u32);
        Ok(strings_range.len() as u32)
    }

    /// Replaces `old_len` bytes at `offset` in the structure block with `new_len` bytes, moving the
    /// rest of the structure block and the strings block.
    ///
    /// The contents of the replacement bytes are unspecified.
    fn splice_struct(
        &mut self,
        offset: usize,
        old_len: usize,
        new_len: usize,
    ) -> Result<(), FdtError> {
        let struct_range = self.struct_range();
        let strings_range = self.strings_range();
        let start = struct_range.start + offset;
        let data_end = strings_range.end;
        let new_data_end = (data_end + new_len)
            .checked_sub(old_len)
            .ok_or(FdtError::BadStructure)?;
        if new_data_end > self.buf.len() {
            return Err(FdtError::NoSpace);
        }
        self.buf
            .copy_within(start + old_len..data_end, start + new_len);

        let header = self.header_mut();
        header
            .size_dt_struct
            .set((struct_range.len() + new_len - old_len) as u32);
        header
            .off_dt_strings
            .set((strings_range.start + new_len - old_len) as u32);
        Ok(())
    }

    /// Creates or resizes the property `name` of `node` to `len` bytes, returning its value for the
    /// caller to fill in.
    ///
    /// A new property is inserted directly after the node's name.
    pub fn set_property_with(
        &mut self,
        node: usize,
        name: &str,
        len: usize,
    ) -> Result<&mut [u8], FdtError> {
        let len_u32 = u32::try_from(len).map_err(|_| FdtError::NoSpace)?;
        let offset = match self.property_offset(node, name)? {
            Some(offset) => {
                let old_len = self.read_u32(offset + 4)? as usize;
                self.splice_struct(
                    offset + PROP_HEADER_SIZE,
                    align4(old_len),
                    align4(len),
                )?;
                offset
            }
            None => {
                let name_offset = self.find_add_string(name)?;
                let (_, offset) = self.next_tag(node)?;
                self.splice_struct(offset, 0, PROP_HEADER_SIZE + align4(len))?;
                let start = self.struct_range().start + offset;
                self.buf[start..start + 4].copy_from_slice(&FDT_PROP.to_be_bytes());
                self.buf[start + 8..start + 12].copy_from_slice(&name_offset.to_be_bytes());
                offset
            }
        };
        let start = self.struct_range().start + offset;
        self.buf[start + 4..start + 8].copy_from_slice(&len_u32.to_be_bytes());
        let value_start = start + PROP_HEADER_SIZE;
        let value = &mut self.buf[value_start..value_start + align4(len)];
        value.fill(0);
        Ok(&mut value[..len])
    }

    /// Sets the property `name` of `node` to the given raw bytes.
    pub fn set_property(&mut self, node: usize, name: &str, value: &[u8]) -> Result<(), FdtError> {
        self.set_property_with(node, name, value.len())?
            .copy_from_slice(value);
        Ok(())
    }

    /// Sets the property `name` of `node` to a NUL-terminated string.
    pub fn set_property_string(
        &mut self,
        node: usize,
        name: &str,
        value: &str,
    ) -> Result<(), FdtError> {
        self.set_property_stringlist(node, name, &[value])
    }

    /// Sets the property `name` of `node` to a list of NUL-terminated strings.
    pub fn set_property_stringlist(
        &mut self,
        node: usize,
        name: &str,
        values: &[&str],
    ) -> Result<(), FdtError> {
        let len = values.iter().map(|value| value.len() + 1).sum();
        let buffer = self.set_property_with(node, name, len)?;
        let mut offset = 0;
        for value in values {
            buffer[offset..offset + value.len()].copy_from_slice(value.as_bytes());
            offset += value.len() + 1;
        }
        Ok(())
    }

    /// Sets the property `name` of `node` to a single big-endian cell.
    pub fn set_property_u32(&mut self, node: usize, name: &str, value: u32) -> Result<(), FdtError> {
        self.set_property(node, name, &value.to_be_bytes())
    }

    /// Sets the property `name` of `node` to an empty value.
    pub fn set_property_empty(&mut self, node: usize, name: &str) -> Result<(), FdtError> {
        self.set_property_with(node, name, 0).map(|_| ())
    }

    /// Adds a child called `name` to `parent`, after `parent`'s properties and before its existing
    /// children. Returns the offset of the new node.
    pub fn add_subnode(&mut self, parent: usize, name: &str) -> Result<usize, FdtError> {
        if name.is_empty() || name.bytes().any(|byte| byte == b'/' || byte == 0) {
            return Err(FdtError::InvalidName);
        }
        match self.subnode_offset(parent, name) {
            Ok(_) => return Err(FdtError::Exists),
            Err(FdtError::NotFound) => {}
            Err(e) => return Err(e),
        }

        let offset = self.end_of_properties(parent)?;
        let name_size = align4(name.len() + 1);
        self.splice_struct(offset, 0, TAG_SIZE + name_size + TAG_SIZE)?;

        let start = self.struct_range().start + offset;
        let node = &mut self.buf[start..start + TAG_SIZE + name_size + TAG_SIZE];
        node.fill(0);
        node[..TAG_SIZE].copy_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        node[TAG_SIZE..TAG_SIZE + name.len()].copy_from_slice(name.as_bytes());
        node[TAG_SIZE + name_size..].copy_from_slice(&FDT_END_NODE.to_be_bytes());
        Ok(offset)
    }
}

/// Returns whether a node called `node_name` matches the `name` being looked up.
fn name_matches(node_name: &[u8], name: &[u8]) -> bool {
    if node_name == name {
        return true;
    }
    // Without a unit address in the lookup, ignore the node's unit address.
    !name.contains(&b'@') && node_name.split(|byte| *byte == b'@').next() == Some(name)
}

/// An iterator over the children of a node.
pub struct Subnodes<'f, 'a> {
    fdt: &'f Fdt<'a>,
    next: Result<Option<usize>, FdtError>,
}

impl Iterator for Subnodes<'_, '_> {
    type Item = Result<usize, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next {
            Ok(Some(node)) => {
                self.next = self.fdt.next_subnode(node);
                Some(Ok(node))
            }
            Ok(None) => None,
            Err(e) => {
                self.next = Ok(None);
                Some(Err(e))
            }
        }
    }
}
