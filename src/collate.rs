//! Stream collation
//!
//! Merges index-ordered streams into aligned tuples without materializing
//! any of them. At each step the smallest head index wins; every input whose
//! head carries that index contributes its item and advances, the others
//! contribute a gap.
//!
//! Inputs must already be strictly ascending and duplicate-free. The
//! collator never re-sorts. Errors from an input are returned as they arrive;
//! the collator does not try to recover.
//!
//! Two shapes are provided:
//!
//! - [`collate2`] pairs two streams of possibly different item types. Pairs
//!   are themselves [`Indexed`], so collations nest:
//!   `collate2(collate2(a, b), c)` aligns three streams.
//! - [`CollateN`] aligns any number of streams of one item type.
//!
//! ```rust
//! use rewind::collate::{collate2, Indexed};
//! use rewind::Index;
//!
//! #[derive(Debug, PartialEq)]
//! struct Item(Index);
//! impl Indexed for Item {
//!     fn index(&self) -> &Index { &self.0 }
//! }
//!
//! let a = vec![Index::from_components(["a"]), Index::from_components(["c"])];
//! let b = vec![Index::from_components(["b"]), Index::from_components(["c"])];
//! let pairs: Vec<_> = collate2(
//!     a.into_iter().map(|i| Ok(Item(i))),
//!     b.into_iter().map(|i| Ok(Item(i))),
//! )
//! .collect::<Result<_, _>>()
//! .unwrap();
//!
//! assert_eq!(pairs.len(), 3);
//! assert!(pairs[0].left.is_some() && pairs[0].right.is_none());
//! assert!(pairs[2].left.is_some() && pairs[2].right.is_some());
//! ```

use crate::entry::Entry;
use crate::error::Result;
use crate::index::Index;

/// Anything carrying an index
pub trait Indexed {
    /// Sort and alignment key
    fn index(&self) -> &Index;
}

impl Indexed for Entry {
    fn index(&self) -> &Index {
        &self.index
    }
}

impl Indexed for Index {
    fn index(&self) -> &Index {
        self
    }
}

/// One aligned step of a two-way collation
#[derive(Debug, Clone, PartialEq)]
pub struct Pair<A, B> {
    /// Index both slots are aligned on
    pub index: Index,
    /// Item from the first stream, if it had this index
    pub left: Option<A>,
    /// Item from the second stream, if it had this index
    pub right: Option<B>,
}

impl<A, B> Indexed for Pair<A, B> {
    fn index(&self) -> &Index {
        &self.index
    }
}

/// Head slot of one input stream
struct Head<I: Iterator> {
    iter: I,
    item: Option<<I as Iterator>::Item>,
    done: bool,
}

impl<T, I> Head<I>
where
    I: Iterator<Item = Result<T>>,
{
    fn new(iter: I) -> Self {
        Head {
            iter,
            item: None,
            done: false,
        }
    }

    /// Pull the next item if the slot is empty
    fn fill(&mut self) -> Result<()> {
        if self.item.is_none() && !self.done {
            match self.iter.next() {
                Some(Ok(item)) => self.item = Some(Ok(item)),
                Some(Err(e)) => return Err(e),
                None => self.done = true,
            }
        }
        Ok(())
    }

    fn peek(&self) -> Option<&T> {
        match &self.item {
            Some(Ok(item)) => Some(item),
            _ => None,
        }
    }

    fn take(&mut self) -> Option<T> {
        match self.item.take() {
            Some(Ok(item)) => Some(item),
            _ => None,
        }
    }
}

/// Two-way collation of heterogeneous streams
pub struct Collate2<L: Iterator, R: Iterator> {
    left: Head<L>,
    right: Head<R>,
}

/// Align two index-ordered streams
pub fn collate2<A, B, L, R>(left: L, right: R) -> Collate2<L::IntoIter, R::IntoIter>
where
    A: Indexed,
    B: Indexed,
    L: IntoIterator<Item = Result<A>>,
    R: IntoIterator<Item = Result<B>>,
{
    Collate2 {
        left: Head::new(left.into_iter()),
        right: Head::new(right.into_iter()),
    }
}

impl<A, B, L, R> Iterator for Collate2<L, R>
where
    A: Indexed,
    B: Indexed,
    L: Iterator<Item = Result<A>>,
    R: Iterator<Item = Result<B>>,
{
    type Item = Result<Pair<A, B>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.left.fill() {
            return Some(Err(e));
        }
        if let Err(e) = self.right.fill() {
            return Some(Err(e));
        }

        let (take_left, take_right) = match (self.left.peek(), self.right.peek()) {
            (None, None) => return None,
            (Some(_), None) => (true, false),
            (None, Some(_)) => (false, true),
            (Some(a), Some(b)) => match a.index().cmp(b.index()) {
                std::cmp::Ordering::Less => (true, false),
                std::cmp::Ordering::Greater => (false, true),
                std::cmp::Ordering::Equal => (true, true),
            },
        };

        let left = if take_left { self.left.take() } else { None };
        let right = if take_right { self.right.take() } else { None };
        let index = match (&left, &right) {
            (Some(a), _) => a.index().clone(),
            (None, Some(b)) => b.index().clone(),
            (None, None) => return None,
        };
        Some(Ok(Pair { index, left, right }))
    }
}

/// One aligned step of an N-way collation
#[derive(Debug, Clone, PartialEq)]
pub struct Aligned<T> {
    /// Index all present slots share
    pub index: Index,
    /// One slot per input, in input order
    pub slots: Vec<Option<T>>,
}

impl<T> Indexed for Aligned<T> {
    fn index(&self) -> &Index {
        &self.index
    }
}

type BoxedStream<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// N-way collation of streams sharing one item type
pub struct CollateN<'a, T> {
    heads: Vec<Head<BoxedStream<'a, T>>>,
}

impl<'a, T: Indexed> CollateN<'a, T> {
    /// Align any number of index-ordered streams
    pub fn new(sources: Vec<BoxedStream<'a, T>>) -> Self {
        CollateN {
            heads: sources.into_iter().map(Head::new).collect(),
        }
    }

    /// Number of inputs
    pub fn width(&self) -> usize {
        self.heads.len()
    }
}

impl<'a, T: Indexed> Iterator for CollateN<'a, T> {
    type Item = Result<Aligned<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        for head in &mut self.heads {
            if let Err(e) = head.fill() {
                return Some(Err(e));
            }
        }

        let min = self
            .heads
            .iter()
            .filter_map(|h| h.peek().map(|item| item.index()))
            .min()?
            .clone();

        let slots = self
            .heads
            .iter_mut()
            .map(|h| {
                if h.peek().map(|item| *item.index() == min).unwrap_or(false) {
                    h.take()
                } else {
                    None
                }
            })
            .collect();

        Some(Ok(Aligned { index: min, slots }))
    }
}
