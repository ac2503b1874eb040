//! Compiled-block cache.
//!
//! Each translated block is recognized through a tagged opcode written
//! over the first guest instruction: the top byte marks "this address has
//! compiled code" and the low 24 bits carry the arena offset of the
//! block's checked entry. The tag is not a valid guest encoding, so
//! everything that reads guest code from outside (`read_instruction`, the
//! save-state path) folds tags back to the original opcode.

use rustc_hash::FxHashMap;
use vex_backend::x86_64::emitter::{emit_jmp, emit_store_imm};
use vex_backend::x86_64::CTX;
use vex_backend::CodeArena;
use vex_core::state::CpuState;

use crate::offsets;

/// Tag marker byte. The top six bits decode as major opcode 63, which is
/// not a valid guest encoding, so a tag can never be mistaken for a real
/// instruction.
pub const EMUHACK_MARKER: u32 = 0xFC;
pub const EMUHACK_MASK: u32 = 0xff00_0000;
pub const EMUHACK_VALUE_MASK: u32 = 0x00ff_ffff;

pub const MAX_BLOCK_EXITS: usize = 8;
pub const MAX_BLOCKS: usize = 16 * 1024;
/// Upper bound on guest instructions per block.
pub const MAX_BLOCK_INSTRUCTIONS: u32 = 512;

/// Bytes reserved per exit stub: `mov [ctx].pc, imm32` (11) + `jmp rel32`
/// (5). Linked stubs rewrite this in place.
pub const EXIT_SIZE: usize = 16;

const INVALID_EXIT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub struct BlockExit {
    /// Guest destination address.
    pub target: u32,
    /// Arena offset of the stub.
    pub offset: u32,
    /// Whether the stub currently jumps straight into another block.
    pub linked: bool,
}

impl BlockExit {
    const EMPTY: Self = Self { target: INVALID_EXIT, offset: 0, linked: false };

    pub fn valid(&self) -> bool {
        self.target != INVALID_EXIT
    }
}

#[derive(Debug, Clone)]
pub struct JitBlock {
    pub original_address: u32,
    pub original_first_opcode: u32,
    /// Arena offset of the tag-validating entry.
    pub checked_entry: u32,
    /// Arena offset of the entry that skips validation; reached only via
    /// a verified direct link (or straight from the translator).
    pub normal_entry: u32,
    pub code_size: u32,
    /// Guest instructions covered (for invalidation overlap checks).
    pub original_size: u32,
    pub exits: [BlockExit; MAX_BLOCK_EXITS],
    /// For a continuation proxy: the root block this region belongs to.
    pub proxy_for: Option<u32>,
    pub invalid: bool,
}

impl JitBlock {
    fn new(addr: u32) -> Self {
        Self {
            original_address: addr,
            original_first_opcode: 0,
            checked_entry: 0,
            normal_entry: 0,
            code_size: 0,
            original_size: 1,
            exits: [BlockExit::EMPTY; MAX_BLOCK_EXITS],
            proxy_for: None,
            invalid: false,
        }
    }

    pub fn contains_address(&self, addr: u32) -> bool {
        addr >= self.original_address
            && addr < self.original_address + self.original_size * 4
    }
}

pub struct BlockCache {
    blocks: Vec<JitBlock>,
    /// Start address -> block number, real blocks only.
    block_map: FxHashMap<u32, u32>,
    /// Checked-entry arena offset -> block number (tag resolution).
    entry_map: FxHashMap<u32, u32>,
    /// Exit target address -> block numbers that exit there.
    links_to: FxHashMap<u32, Vec<u32>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            block_map: FxHashMap::default(),
            entry_map: FxHashMap::default(),
            links_to: FxHashMap::default(),
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_full(&self) -> bool {
        self.blocks.len() >= MAX_BLOCKS
    }

    pub fn block(&self, num: u32) -> &JitBlock {
        &self.blocks[num as usize]
    }

    pub fn block_mut(&mut self, num: u32) -> &mut JitBlock {
        &mut self.blocks[num as usize]
    }

    pub fn allocate_block(&mut self, addr: u32) -> u32 {
        let num = self.blocks.len() as u32;
        self.blocks.push(JitBlock::new(addr));
        num
    }

    /// Record a continuation region compiled into `root`'s code, so that
    /// invalidating the region voids the root block too.
    pub fn proxy_block(&mut self, root: u32, start: u32, size_words: u32) {
        let mut b = JitBlock::new(start);
        b.original_size = size_words.max(1);
        b.proxy_for = Some(root);
        self.blocks.push(b);
    }

    pub fn tag_for(&self, num: u32) -> u32 {
        let entry = self.blocks[num as usize].checked_entry;
        debug_assert!(entry & !EMUHACK_VALUE_MASK == 0, "arena offset exceeds tag space");
        (EMUHACK_MARKER << 24) | entry
    }

    pub fn is_tag(word: u32) -> bool {
        word & EMUHACK_MASK == EMUHACK_MARKER << 24
    }

    /// Resolve a fetched word: a live tag folds back to the original
    /// first opcode of its block.
    pub fn original_opcode_at(&self, word: u32, addr: u32) -> u32 {
        if !Self::is_tag(word) {
            return word;
        }
        match self.entry_map.get(&(word & EMUHACK_VALUE_MASK)) {
            Some(&num) => {
                let b = &self.blocks[num as usize];
                if b.invalid || b.original_address != addr {
                    tracing::error!(word = format_args!("{word:08x}"), "stale block tag");
                    word
                } else {
                    b.original_first_opcode
                }
            }
            None => {
                tracing::error!(word = format_args!("{word:08x}"), "dangling block tag");
                word
            }
        }
    }

    /// Block compiled at exactly `addr`, if still valid.
    pub fn block_num_at(&self, addr: u32) -> Option<u32> {
        self.block_map
            .get(&addr)
            .copied()
            .filter(|&n| !self.blocks[n as usize].invalid)
    }

    /// Register a finished block: record the original opcode, write the
    /// tag into guest memory, and wire up links in both directions.
    pub fn finalize_block(
        &mut self,
        num: u32,
        cpu: &mut CpuState,
        buf: &mut CodeArena,
        enable_link: bool,
    ) {
        let addr = self.blocks[num as usize].original_address;
        let word = cpu.read32_unchecked(addr);
        // Never record another block's tag as an original opcode.
        self.blocks[num as usize].original_first_opcode = self.original_opcode_at(word, addr);
        let tag = self.tag_for(num);
        cpu.write32_unchecked(addr, tag);

        self.block_map.insert(addr, num);
        self.entry_map
            .insert(self.blocks[num as usize].checked_entry, num);

        if enable_link {
            for e in self.blocks[num as usize].exits {
                if e.valid() {
                    self.links_to.entry(e.target).or_default().push(num);
                }
            }
            self.link_block_exits(num, buf);
            // Blocks already compiled may have been waiting for us.
            if let Some(waiters) = self.links_to.get(&addr).cloned() {
                for w in waiters {
                    self.link_block_exits(w, buf);
                }
            }
        }
    }

    /// Patch every resolvable exit of `num` to jump directly at its
    /// target's unchecked entry.
    pub fn link_block_exits(&mut self, num: u32, buf: &mut CodeArena) {
        if self.blocks[num as usize].invalid {
            return;
        }
        let exits = self.blocks[num as usize].exits;
        for (i, e) in exits.iter().enumerate() {
            if !e.valid() || e.linked {
                continue;
            }
            let Some(target_num) = self.block_num_at(e.target) else {
                continue;
            };
            let target_entry = self.blocks[target_num as usize].normal_entry as usize;
            Self::write_linked_stub(buf, e.offset as usize, target_entry);
            self.blocks[num as usize].exits[i].linked = true;
        }
    }

    fn write_linked_stub(buf: &mut CodeArena, stub: usize, target: usize) {
        let saved = buf.offset();
        buf.set_offset(stub);
        emit_jmp(buf, target);
        let used = buf.offset() - stub;
        buf.poison(EXIT_SIZE - used);
        buf.set_offset(saved);
    }

    fn write_default_stub(buf: &mut CodeArena, stub: usize, dest: u32, dispatcher: usize) {
        let saved = buf.offset();
        buf.set_offset(stub);
        emit_store_imm(buf, CTX, offsets::pc(), dest);
        emit_jmp(buf, dispatcher);
        let used = buf.offset() - stub;
        buf.poison(EXIT_SIZE - used);
        buf.set_offset(saved);
    }

    /// Emit the default "store PC, return to dispatcher" form of an exit
    /// stub at the current arena position.
    pub fn emit_default_stub(buf: &mut CodeArena, dest: u32, dispatcher: usize) {
        let start = buf.offset();
        emit_store_imm(buf, CTX, offsets::pc(), dest);
        emit_jmp(buf, dispatcher);
        let used = buf.offset() - start;
        buf.poison(EXIT_SIZE - used);
    }

    /// Void every block overlapping `[start, end)`, restoring original
    /// opcodes and unlinking every exit stub that targeted them. Code
    /// memory itself is only reclaimed by `clear`.
    pub fn invalidate_range(
        &mut self,
        start: u32,
        end: u32,
        cpu: &mut CpuState,
        buf: &mut CodeArena,
        dispatcher: usize,
    ) {
        let mut doomed = Vec::new();
        for (num, b) in self.blocks.iter().enumerate() {
            if b.invalid {
                continue;
            }
            let b_start = b.original_address;
            let b_end = b.original_address + b.original_size * 4;
            if b_start < end && start < b_end {
                doomed.push(num as u32);
            }
        }
        for num in doomed {
            self.destroy_block(num, cpu, buf, dispatcher);
        }
    }

    fn destroy_block(&mut self, num: u32, cpu: &mut CpuState, buf: &mut CodeArena, dispatcher: usize) {
        if self.blocks[num as usize].invalid {
            return;
        }
        if let Some(root) = self.blocks[num as usize].proxy_for {
            // A proxy has no code of its own; the root dies with it.
            self.blocks[num as usize].invalid = true;
            self.destroy_block(root, cpu, buf, dispatcher);
            return;
        }
        self.blocks[num as usize].invalid = true;
        let addr = self.blocks[num as usize].original_address;

        // Restore the original opcode if our tag is still in place.
        let tag = self.tag_for(num);
        if cpu.addr_valid(addr) && cpu.read32_unchecked(addr) == tag {
            let orig = self.blocks[num as usize].original_first_opcode;
            cpu.write32_unchecked(addr, orig);
        }

        if self.block_map.get(&addr) == Some(&num) {
            self.block_map.remove(&addr);
        }
        self.entry_map
            .remove(&self.blocks[num as usize].checked_entry);

        // Unlink incoming direct jumps.
        if let Some(srcs) = self.links_to.get(&addr).cloned() {
            for src in srcs {
                if self.blocks[src as usize].invalid {
                    continue;
                }
                let exits = self.blocks[src as usize].exits;
                for (i, e) in exits.iter().enumerate() {
                    if e.valid() && e.linked && e.target == addr {
                        Self::write_default_stub(buf, e.offset as usize, e.target, dispatcher);
                        self.blocks[src as usize].exits[i].linked = false;
                    }
                }
            }
        }

        // Send stragglers entering through the stale checked entry back
        // to the dispatcher.
        Self::write_default_stub(
            buf,
            self.blocks[num as usize].checked_entry as usize,
            addr,
            dispatcher,
        );

        // Any proxies rooted in this block die too.
        let proxies: Vec<u32> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.invalid && b.proxy_for == Some(num))
            .map(|(n, _)| n as u32)
            .collect();
        for p in proxies {
            self.blocks[p as usize].invalid = true;
        }
    }

    /// Drop everything. The caller resets the arena cursor.
    pub fn clear(&mut self, cpu: &mut CpuState) {
        for num in 0..self.blocks.len() as u32 {
            let b = &self.blocks[num as usize];
            if b.invalid || b.proxy_for.is_some() {
                continue;
            }
            let addr = b.original_address;
            let tag = self.tag_for(num);
            if cpu.addr_valid(addr) && cpu.read32_unchecked(addr) == tag {
                cpu.write32_unchecked(addr, b.original_first_opcode);
            }
        }
        self.blocks.clear();
        self.block_map.clear();
        self.entry_map.clear();
        self.links_to.clear();
    }

    /// Temporarily remove every live tag from guest memory so an outside
    /// reader (save states, breakpoints) sees real opcodes. Returns the
    /// restore list for [`Self::restore_tags`].
    pub fn save_and_clear_tags(&self, cpu: &mut CpuState) -> Vec<(u32, u32)> {
        let mut saved = Vec::new();
        for (num, b) in self.blocks.iter().enumerate() {
            if b.invalid || b.proxy_for.is_some() {
                continue;
            }
            let tag = self.tag_for(num as u32);
            if cpu.addr_valid(b.original_address)
                && cpu.read32_unchecked(b.original_address) == tag
            {
                cpu.write32_unchecked(b.original_address, b.original_first_opcode);
                saved.push((b.original_address, tag));
            }
        }
        saved
    }

    pub fn restore_tags(&self, cpu: &mut CpuState, saved: &[(u32, u32)]) {
        for &(addr, tag) in saved {
            if cpu.addr_valid(addr) {
                cpu.write32_unchecked(addr, tag);
            }
        }
    }
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}
