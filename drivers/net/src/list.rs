//! Index-linked FIFO lists over a fixed arena of buffer nodes.
//!
//! Nodes never move and are never freed while the ring lives; a list only
//! stores indices, so a buffer leaving a node can not leave a dangling link
//! behind.

use alloc::vec::Vec;

use crate::NetBuf;

/// A slot that may hold one received or spare buffer.
#[derive(Debug, Default)]
pub(crate) struct Node {
    pub buf: Option<NetBuf>,
    /// Bytes the device wrote into `buf`.
    pub len: usize,
    /// `buf` ends a frame.
    pub last: bool,
    next: Option<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct NodeList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl NodeList {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
pub(crate) struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    /// Creates `count` empty nodes, all linked into the returned list.
    pub fn new(count: usize) -> (Self, NodeList) {
        let mut arena = Self {
            nodes: (0..count).map(|_| Node::default()).collect(),
        };
        let mut all = NodeList::new();
        for idx in 0..count {
            arena.push_back(&mut all, idx);
        }
        (arena, all)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn push_back(&mut self, list: &mut NodeList, idx: usize) {
        self.nodes[idx].next = None;
        match list.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => list.head = Some(idx),
        }
        list.tail = Some(idx);
        list.len += 1;
    }

    pub fn pop_front(&mut self, list: &mut NodeList) -> Option<usize> {
        let idx = list.head?;
        list.head = self.nodes[idx].next.take();
        if list.head.is_none() {
            list.tail = None;
        }
        list.len -= 1;
        Some(idx)
    }

    /// Moves every node of `src` to the back of `dst`, keeping their order.
    pub fn append(&mut self, dst: &mut NodeList, src: &mut NodeList) {
        let Some(src_head) = src.head else {
            return;
        };
        match dst.tail {
            Some(tail) => self.nodes[tail].next = Some(src_head),
            None => dst.head = Some(src_head),
        }
        dst.tail = src.tail;
        dst.len += src.len;
        *src = NodeList::new();
    }

    /// Empties `list` into `dst`, dropping the buffers its nodes hold.
    ///
    /// Returns how many buffers went back to their pool.
    pub fn release_all(&mut self, list: &mut NodeList, dst: &mut NodeList) -> usize {
        let mut released = 0;
        while let Some(idx) = self.pop_front(list) {
            let node = &mut self.nodes[idx];
            if node.buf.take().is_some() {
                released += 1;
            }
            node.len = 0;
            node.last = false;
            self.push_back(dst, idx);
        }
        released
    }
}
