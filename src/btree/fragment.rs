//! Fragmented values: storage for values too large to live inline in a
//! leaf (C7).
//!
//! The leaf keeps a descriptor in place of the value:
//! ```text
//! header byte   0xF0 | flags   (bit 0: indirect, bit 1: inline prefix)
//! varint        total value length
//! [u16 + bytes] inline prefix, when flag set
//! pointers      either N direct 6-byte page ids, or one 6-byte inode id
//! ```
//!
//! The prefix absorbs `total_length % page_size` when that remainder is
//! small, so every fragment page is completely full; otherwise the last
//! fragment page is partially used. Direct pointers are used while the
//! descriptor stays leaf-friendly; beyond that a radix tree of inode
//! pages (fan-out `page_size / 6`) addresses the fragments, with
//! `ceil(log_fanout(pages))` levels.

use log::debug;

use crate::btree::node::{Node, NodeType};
use crate::btree::tree::TreeContext;
use crate::error::{ErrorKind, SmallError};
use crate::io::{get_u48, put_u48, SmallReader, SmallWriter};
use crate::types::{PageId, SmallResult, NO_PAGE};

const FLAG_INDIRECT: u8 = 0x01;
const FLAG_PREFIX: u8 = 0x02;

/// Largest prefix worth keeping inline; beyond this the tail fragment
/// page is simply left partially filled.
const MAX_PREFIX: usize = 256;

/// 48-bit page addressing bounds the representable value size.
const MAX_FRAGMENTED_LENGTH: u64 = 1 << 48;

/// Direct pointers are used while the whole descriptor stays small
/// enough to be split-friendly inside a leaf.
pub fn max_direct_pages(page_size: usize) -> usize {
    (page_size / 2 - 64) / 6
}

pub fn inode_fanout(page_size: usize) -> usize {
    page_size / 6
}

/// A parsed descriptor, borrowed from a leaf entry.
pub struct FragmentedValue {
    pub total_length: u64,
    pub prefix: Vec<u8>,
    pub direct: Vec<PageId>,
    pub inode_root: PageId,
    pub levels: u32,
}

pub fn parse(flags: u8, descriptor: &[u8], page_size: usize) -> Result<FragmentedValue, SmallError> {
    let mut r = SmallReader::new(descriptor);
    let total_length = r.read_varint()?;
    let mut prefix = Vec::new();
    if flags & FLAG_PREFIX != 0 {
        let len = r.read_u16()? as usize;
        prefix = r.read_exact(len)?.to_vec();
    }
    let remainder = total_length - prefix.len() as u64;
    let pages = ((remainder + page_size as u64 - 1) / page_size as u64) as usize;
    if flags & FLAG_INDIRECT != 0 {
        let inode_root = r.read_u48()?;
        let levels = levels_for(pages, page_size);
        Ok(FragmentedValue {
            total_length,
            prefix,
            direct: Vec::new(),
            inode_root,
            levels,
        })
    } else {
        let mut direct = Vec::with_capacity(pages);
        for _ in 0..pages {
            direct.push(r.read_u48()?);
        }
        Ok(FragmentedValue {
            total_length,
            prefix,
            direct,
            inode_root: NO_PAGE,
            levels: 0,
        })
    }
}

/// Levels of inode tree needed so that `fanout^levels >= pages`.
fn levels_for(pages: usize, page_size: usize) -> u32 {
    let fanout = inode_fanout(page_size) as u64;
    let mut levels = 1;
    let mut cap = fanout;
    while cap < pages as u64 {
        cap *= fanout;
        levels += 1;
    }
    levels
}

/// Store `value` as fragments, returning the encoded value portion
/// (header byte + descriptor) for the leaf entry. Freshly written pages
/// are direct store writes; nothing here touches the node cache until a
/// read pulls fragments back in.
pub fn write_fragmented(ctx: &TreeContext, value: &[u8]) -> Result<Vec<u8>, SmallError> {
    if value.len() as u64 >= MAX_FRAGMENTED_LENGTH {
        return Err(SmallError::new(
            ErrorKind::LargeValue,
            &format!("value of {} bytes is not addressable", value.len()),
        ));
    }
    let page_size = ctx.store.page_size();

    let remainder = value.len() % page_size;
    let (prefix, tail) = if remainder > 0 && remainder <= MAX_PREFIX {
        value.split_at(remainder)
    } else {
        value.split_at(0)
    };

    let pages_needed = (tail.len() + page_size - 1) / page_size;
    let mut page_ids = Vec::with_capacity(pages_needed);
    let mut buf = vec![0u8; page_size];
    for chunk in tail.chunks(page_size) {
        let pid = ctx.alloc_tree_page()?;
        if chunk.len() == page_size {
            ctx.store.write_page(pid, chunk)?;
        } else {
            buf[..chunk.len()].copy_from_slice(chunk);
            buf[chunk.len()..].fill(0);
            ctx.store.write_page(pid, &buf)?;
        }
        page_ids.push(pid);
    }

    let mut flags = 0u8;
    if !prefix.is_empty() {
        flags |= FLAG_PREFIX;
    }

    let mut w = SmallWriter::with_capacity(16 + prefix.len() + 6 * page_ids.len().min(8));
    if page_ids.len() <= max_direct_pages(page_size) {
        w.write_u8(0xF0 | flags);
        w.write_varint(value.len() as u64);
        if !prefix.is_empty() {
            w.write_u16(prefix.len() as u16);
            w.write_bytes(prefix);
        }
        for pid in &page_ids {
            w.write_u48(*pid);
        }
    } else {
        flags |= FLAG_INDIRECT;
        let root = build_inode_tree(ctx, &page_ids)?;
        w.write_u8(0xF0 | flags);
        w.write_varint(value.len() as u64);
        if !prefix.is_empty() {
            w.write_u16(prefix.len() as u16);
            w.write_bytes(prefix);
        }
        w.write_u48(root);
    }
    debug!(
        "fragmented value stored: {} bytes over {} pages, prefix {}",
        value.len(),
        page_ids.len(),
        prefix.len()
    );
    Ok(w.to_bytes())
}

/// Build the inode radix tree bottom-up over the fragment page ids and
/// return the root inode page.
fn build_inode_tree(ctx: &TreeContext, leaves: &[PageId]) -> Result<PageId, SmallError> {
    let page_size = ctx.store.page_size();
    let fanout = inode_fanout(page_size);

    let mut level: Vec<PageId> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + fanout - 1) / fanout);
        for group in level.chunks(fanout) {
            let pid = ctx.alloc_tree_page()?;
            let mut page = vec![0u8; page_size];
            for (i, child) in group.iter().enumerate() {
                put_u48(&mut page, i * 6, *child);
            }
            ctx.store.write_page(pid, &page)?;
            next.push(pid);
        }
        level = next;
    }
    Ok(level[0])
}

/// Read `out.len()` bytes starting at `pos`; short result at the value
/// end. Returns the bytes actually read.
pub fn read_range(
    ctx: &TreeContext,
    value: &FragmentedValue,
    pos: u64,
    out: &mut [u8],
) -> Result<usize, SmallError> {
    if pos >= value.total_length {
        return Ok(0);
    }
    let page_size = ctx.store.page_size() as u64;
    let want = out.len().min((value.total_length - pos) as usize);
    let mut done = 0usize;

    while done < want {
        let at = pos + done as u64;
        let n;
        if (at as usize) < value.prefix.len() {
            let avail = value.prefix.len() - at as usize;
            n = avail.min(want - done);
            out[done..done + n].copy_from_slice(&value.prefix[at as usize..at as usize + n]);
        } else {
            let body_at = at - value.prefix.len() as u64;
            let page_index = (body_at / page_size) as usize;
            let offset = (body_at % page_size) as usize;
            let pid = fragment_page_id(ctx, value, page_index)?;
            let pod = load_fragment(ctx, pid)?;
            let node = pod.read().unwrap();
            let avail = page_size as usize - offset;
            n = avail.min(want - done);
            out[done..done + n].copy_from_slice(&node.data()[offset..offset + n]);
        }
        done += n;
    }
    Ok(done)
}

/// Materialise the whole value.
pub fn read_full(ctx: &TreeContext, value: &FragmentedValue) -> Result<Vec<u8>, SmallError> {
    let mut out = vec![0u8; value.total_length as usize];
    let n = read_range(ctx, value, 0, &mut out)?;
    debug_assert_eq!(n, out.len());
    Ok(out)
}

/// Resolve fragment page `index` through the direct array or the inode
/// tree: each level divides by its capacity and recurses on the
/// remainder.
fn fragment_page_id(
    ctx: &TreeContext,
    value: &FragmentedValue,
    index: usize,
) -> Result<PageId, SmallError> {
    if value.inode_root == NO_PAGE {
        return value.direct.get(index).copied().ok_or_else(|| {
            SmallError::corrupt(&format!("fragment index {} out of range", index))
        });
    }
    let fanout = inode_fanout(ctx.store.page_size());
    let mut level_cap = (fanout as u64).pow(value.levels - 1);
    let mut pid = value.inode_root;
    let mut remaining = index as u64;
    for _ in 0..value.levels {
        let pod = load_fragment(ctx, pid)?;
        let node = pod.read().unwrap();
        let slot = (remaining / level_cap) as usize;
        pid = get_u48(node.data(), slot * 6);
        if pid == NO_PAGE {
            return Err(SmallError::corrupt("hole in inode tree"));
        }
        remaining %= level_cap;
        if level_cap == 1 {
            break;
        }
        level_cap /= fanout as u64;
    }
    Ok(pid)
}

fn load_fragment(
    ctx: &TreeContext,
    pid: PageId,
) -> Result<crate::types::Pod<Node>, SmallError> {
    if let Some(pod) = ctx.cache.find_fragment(pid) {
        let valid = pod.read().unwrap().pid == pid;
        if valid {
            return Ok(pod);
        }
        ctx.cache.remove_fragment(pid);
    }
    let mut node = Node::new_empty(ctx.store.page_size());
    ctx.store.read_page(pid, node.data_mut())?;
    node.pid = pid;
    node.node_type = NodeType::Fragment;
    let pod = std::sync::Arc::new(std::sync::RwLock::new(node));
    ctx.cache.insert_fragment(pid, pod.clone());
    Ok(pod)
}

/// Free every page behind a fragmented value (update and committed
/// delete paths).
pub fn free(ctx: &TreeContext, value: &FragmentedValue) -> SmallResult {
    let page_size = ctx.store.page_size();
    let pages = ((value.total_length - value.prefix.len() as u64
        + page_size as u64
        - 1)
        / page_size as u64) as usize;

    if value.inode_root == NO_PAGE {
        for pid in &value.direct {
            ctx.cache.remove_fragment(*pid);
            ctx.pm.delete_page(*pid)?;
        }
        return Ok(());
    }
    free_inode_level(ctx, value.inode_root, value.levels, pages)?;
    Ok(())
}

fn free_inode_level(
    ctx: &TreeContext,
    pid: PageId,
    levels: u32,
    pages_below: usize,
) -> Result<usize, SmallError> {
    let page_size = ctx.store.page_size();
    let fanout = inode_fanout(page_size);

    if levels == 0 {
        // a fragment page itself
        ctx.cache.remove_fragment(pid);
        ctx.pm.delete_page(pid)?;
        return Ok(1);
    }

    let mut page = vec![0u8; page_size];
    ctx.store.read_page(pid, &mut page)?;
    let mut freed = 0usize;
    for slot in 0..fanout {
        if freed >= pages_below {
            break;
        }
        let child = get_u48(&page, slot * 6);
        if child == NO_PAGE {
            break;
        }
        freed += free_inode_level(ctx, child, levels - 1, pages_below - freed)?;
    }
    ctx.cache.remove_fragment(pid);
    ctx.pm.delete_page(pid)?;
    Ok(freed)
}
