//! Tree reduction over flat index-ordered streams
//!
//! A [`TreeReducer`] simulates recursive descent through a directory tree
//! while being fed one item at a time in ascending index order. It keeps a
//! stack of open [`Branch`]es, one per directory level currently entered:
//!
//! 1. The first item opens the root branch.
//! 2. Each later item first closes every open branch whose base index is not
//!    a prefix of the item's index: `end` on the closed branch, then
//!    `branch_complete` on its parent so results fold upward.
//! 3. The item is then either handled in place by the top branch
//!    (`fast_process`) or opens a new child branch (`start`).
//! 4. [`TreeReducer::finish`] closes everything and hands back the root.
//!
//! No call stack is tied up while waiting for the next item, so the whole
//! reducer state is a plain value. With serializable branches it can be
//! persisted mid-stream and picked up again later, which is how backup
//! sessions resume.
//!
//! Errors returned by branch methods are not swallowed; branches that want
//! to tolerate per-file errors must handle them internally.

use crate::collate::Indexed;
use crate::error::{Result, RewindError};
use crate::index::Index;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Per-directory state machine driven by a [`TreeReducer`]
pub trait Branch: Sized {
    /// Items fed to the reducer
    type Item: Indexed;
    /// Shared state borrowed for the duration of each call
    type Context;

    /// Create a fresh, unopened branch
    fn new(ctx: &mut Self::Context) -> Self;

    /// Enter the directory (or subtree root) named by `item`
    fn start(&mut self, ctx: &mut Self::Context, item: Self::Item) -> Result<()>;

    /// Leave the directory after all of its descendants were processed
    fn end(&mut self, ctx: &mut Self::Context) -> Result<()>;

    /// Fold a closed child branch into this one
    fn branch_complete(&mut self, ctx: &mut Self::Context, child: Self) -> Result<()>;

    /// True if `item` can be handled without opening a child branch
    fn can_fast_process(&self, item: &Self::Item) -> bool;

    /// Handle a leaf item in place
    fn fast_process(&mut self, ctx: &mut Self::Context, item: Self::Item) -> Result<()>;
}

/// What to do with an index that is not strictly greater than the last one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPolicy {
    /// Log a warning and skip the item
    #[default]
    Lenient,
    /// Fail with [`RewindError::OutOfOrder`]
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame<B> {
    base: Index,
    branch: B,
}

/// Stack-based reducer; serializable whenever its branches are
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeReducer<B> {
    stack: Vec<Frame<B>>,
    last_index: Option<Index>,
    policy: OrderPolicy,
    processed: u64,
}

impl<B> Default for TreeReducer<B> {
    fn default() -> Self {
        Self::new(OrderPolicy::default())
    }
}

impl<B> TreeReducer<B> {
    /// Create an empty reducer
    pub fn new(policy: OrderPolicy) -> Self {
        TreeReducer {
            stack: Vec::new(),
            last_index: None,
            policy,
            processed: 0,
        }
    }

    /// Last index accepted
    pub fn last_index(&self) -> Option<&Index> {
        self.last_index.as_ref()
    }

    /// Number of branches currently open
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Items accepted so far
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Ordering policy in force
    pub fn policy(&self) -> OrderPolicy {
        self.policy
    }
}

impl<B: Branch> TreeReducer<B> {
    /// Feed one item
    ///
    /// Returns `false` when a lenient reducer skipped an out-of-order item.
    pub fn process(&mut self, ctx: &mut B::Context, item: B::Item) -> Result<bool> {
        let index = item.index().clone();

        if let Some(last) = &self.last_index {
            if index <= *last {
                return match self.policy {
                    OrderPolicy::Lenient => {
                        warn!("Skipping out-of-order index {} after {}", index, last);
                        Ok(false)
                    }
                    OrderPolicy::Strict => Err(RewindError::OutOfOrder {
                        previous: last.to_string(),
                        current: index.to_string(),
                    }),
                };
            }
        }

        if self.stack.is_empty() {
            if let Some(last) = &self.last_index {
                return Err(RewindError::IndexOutsideRoot {
                    root: last.to_string(),
                    index: index.to_string(),
                });
            }
            self.open(ctx, index.clone(), item)?;
        } else {
            self.unwind_to(ctx, &index)?;
            let top = self
                .stack
                .last_mut()
                .ok_or_else(|| RewindError::internal("reducer stack emptied while unwinding"))?;
            if top.branch.can_fast_process(&item) {
                trace!("Fast-processing {}", index);
                top.branch.fast_process(ctx, item)?;
            } else {
                self.open(ctx, index.clone(), item)?;
            }
        }

        self.last_index = Some(index);
        self.processed += 1;
        Ok(true)
    }

    /// Close every open branch and return the root
    pub fn finish(mut self, ctx: &mut B::Context) -> Result<Option<B>> {
        while self.stack.len() > 1 {
            self.close_top(ctx)?;
        }
        match self.stack.pop() {
            Some(mut root) => {
                root.branch.end(ctx)?;
                Ok(Some(root.branch))
            }
            None => Ok(None),
        }
    }

    fn open(&mut self, ctx: &mut B::Context, index: Index, item: B::Item) -> Result<()> {
        trace!("Opening branch {}", index);
        let mut branch = B::new(ctx);
        branch.start(ctx, item)?;
        self.stack.push(Frame {
            base: index,
            branch,
        });
        Ok(())
    }

    /// Close branches until the top one contains `index`
    fn unwind_to(&mut self, ctx: &mut B::Context, index: &Index) -> Result<()> {
        loop {
            let top = match self.stack.last() {
                Some(top) => top,
                None => return Ok(()),
            };
            if index.starts_with(&top.base) {
                return Ok(());
            }
            if self.stack.len() == 1 {
                return Err(RewindError::IndexOutsideRoot {
                    root: top.base.to_string(),
                    index: index.to_string(),
                });
            }
            self.close_top(ctx)?;
        }
    }

    fn close_top(&mut self, ctx: &mut B::Context) -> Result<()> {
        let mut frame = match self.stack.pop() {
            Some(frame) => frame,
            None => return Ok(()),
        };
        trace!("Closing branch {}", frame.base);
        frame.branch.end(ctx)?;
        match self.stack.last_mut() {
            Some(parent) => parent.branch.branch_complete(ctx, frame.branch),
            None => Ok(()),
        }
    }
}
