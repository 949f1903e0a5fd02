//! Intrusive red-black tree.
//!
//! Nodes embed an [`RbLink`]; the color bit is stashed in the low bit of the
//! parent pointer so the link costs exactly three words, matching the
//! layout the allocator-facing structures (`Mapping`'s by-vstart and
//! by-hole_size trees, the scheduler's vruntime tree) were sized around.

use core::{cmp::Ordering, ptr::NonNull};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Color {
    Red,
    Black,
}

/// Embed this in a node to make it a red-black tree member.
pub struct RbLink<T> {
    // Low bit: 0 = Red, 1 = Black. Remaining bits: parent pointer.
    parent_color: core::cell::Cell<usize>,
    left: core::cell::Cell<Option<NonNull<T>>>,
    right: core::cell::Cell<Option<NonNull<T>>>,
}

impl<T> Default for RbLink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RbLink<T> {
    /// Create a detached link.
    pub const fn new() -> Self {
        Self {
            parent_color: core::cell::Cell::new(1), // Black, no parent
            left: core::cell::Cell::new(None),
            right: core::cell::Cell::new(None),
        }
    }

    fn color(&self) -> Color {
        if self.parent_color.get() & 1 == 1 {
            Color::Black
        } else {
            Color::Red
        }
    }

    fn set_color(&self, color: Color) {
        let parent = self.parent_color.get() & !1;
        let bit = match color {
            Color::Red => 0,
            Color::Black => 1,
        };
        self.parent_color.set(parent | bit);
    }

    fn parent(&self) -> Option<NonNull<T>> {
        let p = self.parent_color.get() & !1;
        if p == 0 {
            None
        } else {
            NonNull::new(p as *mut T)
        }
    }

    fn set_parent(&self, parent: Option<NonNull<T>>) {
        let bit = self.parent_color.get() & 1;
        let p = parent.map_or(0, |p| p.as_ptr() as usize);
        self.parent_color.set(p | bit);
    }
}

/// Gives the tree access to a node's link and sort key.
///
/// `Tag` lets one type carry more than one [`RbLink`] and sit in more than
/// one tree at a time (a mapping's by-`vstart` tree and by-`hole_size` tree)
/// — each ordering implements `RbNode` for a distinct zero-sized `Tag`.
/// Single-tree types can ignore `Tag` and implement `RbNode` (i.e.
/// `RbNode<()>`) as before.
pub trait RbNode<Tag = ()> {
    /// Ordering key type.
    type Key: Ord;

    /// The link embedded in `self`.
    fn link(&self) -> &RbLink<Self>
    where
        Self: Sized;

    /// Sort key for this node.
    fn key(&self) -> Self::Key;
}

/// Result of locating where a key would sit in the tree: the parent it would
/// hang off of, and which side. `None` parent means "tree is empty".
pub struct InsertSlot<T> {
    parent: Option<NonNull<T>>,
    go_left: bool,
}

/// An intrusive red-black tree ordered by `T::key()`.
pub struct RbTree<T: RbNode<Tag>, Tag = ()> {
    root: Option<NonNull<T>>,
    len: usize,
    _tag: core::marker::PhantomData<Tag>,
}

impl<T: RbNode<Tag>, Tag> Default for RbTree<T, Tag> {
    fn default() -> Self {
        Self::new()
    }
}

// The tree owns nothing but pointers into externally-synchronized node
// storage; `Send` lets it live inside a `Spinlock`/`Lock`.
unsafe impl<T: RbNode<Tag>, Tag> Send for RbTree<T, Tag> {}

unsafe fn link<'a, T: RbNode<Tag>, Tag>(n: NonNull<T>) -> &'a RbLink<T> {
    <T as RbNode<Tag>>::link(n.as_ref())
}

impl<T: RbNode<Tag>, Tag> RbTree<T, Tag> {
    /// Create an empty tree.
    pub const fn new() -> Self {
        Self { root: None, len: 0, _tag: core::marker::PhantomData }
    }

    /// Number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Locate the slot a key would occupy, without mutating the tree.
    /// Returns `Err(existing)` if an equal key is already present.
    pub fn find_slot(&self, key: &T::Key) -> Result<InsertSlot<T>, NonNull<T>> {
        let mut parent = None;
        let mut cur = self.root;
        let mut go_left = true;

        while let Some(node) = cur {
            parent = Some(node);
            let node_key = unsafe { node.as_ref().key() };
            match key.cmp(&node_key) {
                Ordering::Less => {
                    go_left = true;
                    cur = unsafe { link::<_, Tag>(node).left.get() };
                }
                Ordering::Greater => {
                    go_left = false;
                    cur = unsafe { link::<_, Tag>(node).right.get() };
                }
                Ordering::Equal => return Err(node),
            }
        }

        Ok(InsertSlot { parent, go_left })
    }

    /// Find the node matching `key`, if any.
    pub fn find(&self, key: &T::Key) -> Option<NonNull<T>> {
        match self.find_slot(key) {
            Err(n) => Some(n),
            Ok(_) => None,
        }
    }

    /// Insert `node`, using a previously located slot. Callers that already
    /// know the insertion point (e.g. after a failed `find_slot`) can skip a
    /// second tree walk.
    ///
    /// # Safety
    ///
    /// `slot` must have been produced by `self.find_slot` with no
    /// intervening mutation, and `node` must not already be linked.
    pub unsafe fn insert_at_slot(&mut self, node: NonNull<T>, slot: InsertSlot<T>) {
        let l = link::<_, Tag>(node);
        l.set_parent(slot.parent);
        l.left.set(None);
        l.right.set(None);
        l.set_color(Color::Red);

        match slot.parent {
            None => self.root = Some(node),
            Some(parent) => {
                if slot.go_left {
                    link::<_, Tag>(parent).left.set(Some(node));
                } else {
                    link::<_, Tag>(parent).right.set(Some(node));
                }
            }
        }

        self.len += 1;
        self.fix_insert(node);
    }

    /// Insert `node`, walking the tree to find its slot.
    ///
    /// # Safety
    ///
    /// `node` must not already be linked into this (or any) tree, and no
    /// equal key may already be present.
    pub unsafe fn insert(&mut self, node: NonNull<T>) {
        let key = node.as_ref().key();
        let slot = match self.find_slot(&key) {
            Ok(slot) => slot,
            Err(_) => return, // duplicate key: caller's invariant violated, ignore
        };
        self.insert_at_slot(node, slot);
    }

    fn rotate_left(&mut self, x: NonNull<T>) {
        unsafe {
            let y = link::<_, Tag>(x).right.get().expect("rotate_left requires right child");
            link::<_, Tag>(x).right.set(link::<_, Tag>(y).left.get());
            if let Some(yl) = link::<_, Tag>(y).left.get() {
                link::<_, Tag>(yl).set_parent(Some(x));
            }
            link::<_, Tag>(y).set_parent(link::<_, Tag>(x).parent());
            match link::<_, Tag>(x).parent() {
                None => self.root = Some(y),
                Some(p) if link::<_, Tag>(p).left.get() == Some(x) => link::<_, Tag>(p).left.set(Some(y)),
                Some(p) => link::<_, Tag>(p).right.set(Some(y)),
            }
            link::<_, Tag>(y).left.set(Some(x));
            link::<_, Tag>(x).set_parent(Some(y));
        }
    }

    fn rotate_right(&mut self, x: NonNull<T>) {
        unsafe {
            let y = link::<_, Tag>(x).left.get().expect("rotate_right requires left child");
            link::<_, Tag>(x).left.set(link::<_, Tag>(y).right.get());
            if let Some(yr) = link::<_, Tag>(y).right.get() {
                link::<_, Tag>(yr).set_parent(Some(x));
            }
            link::<_, Tag>(y).set_parent(link::<_, Tag>(x).parent());
            match link::<_, Tag>(x).parent() {
                None => self.root = Some(y),
                Some(p) if link::<_, Tag>(p).right.get() == Some(x) => link::<_, Tag>(p).right.set(Some(y)),
                Some(p) => link::<_, Tag>(p).left.set(Some(y)),
            }
            link::<_, Tag>(y).right.set(Some(x));
            link::<_, Tag>(x).set_parent(Some(y));
        }
    }

    fn fix_insert(&mut self, mut z: NonNull<T>) {
        unsafe {
            while let Some(parent) = link::<_, Tag>(z).parent() {
                if link::<_, Tag>(parent).color() == Color::Black {
                    break;
                }
                let grandparent = link::<_, Tag>(parent)
                    .parent()
                    .expect("red node must have a black grandparent");
                if Some(parent) == link::<_, Tag>(grandparent).left.get() {
                    let uncle = link::<_, Tag>(grandparent).right.get();
                    if uncle.map(|u| link::<_, Tag>(u).color()) == Some(Color::Red) {
                        link::<_, Tag>(parent).set_color(Color::Black);
                        link::<_, Tag>(uncle.unwrap()).set_color(Color::Black);
                        link::<_, Tag>(grandparent).set_color(Color::Red);
                        z = grandparent;
                    } else {
                        if Some(z) == link::<_, Tag>(parent).right.get() {
                            z = parent;
                            self.rotate_left(z);
                        }
                        let parent = link::<_, Tag>(z).parent().unwrap();
                        let grandparent = link::<_, Tag>(parent).parent().unwrap();
                        link::<_, Tag>(parent).set_color(Color::Black);
                        link::<_, Tag>(grandparent).set_color(Color::Red);
                        self.rotate_right(grandparent);
                    }
                } else {
                    let uncle = link::<_, Tag>(grandparent).left.get();
                    if uncle.map(|u| link::<_, Tag>(u).color()) == Some(Color::Red) {
                        link::<_, Tag>(parent).set_color(Color::Black);
                        link::<_, Tag>(uncle.unwrap()).set_color(Color::Black);
                        link::<_, Tag>(grandparent).set_color(Color::Red);
                        z = grandparent;
                    } else {
                        if Some(z) == link::<_, Tag>(parent).left.get() {
                            z = parent;
                            self.rotate_right(z);
                        }
                        let parent = link::<_, Tag>(z).parent().unwrap();
                        let grandparent = link::<_, Tag>(parent).parent().unwrap();
                        link::<_, Tag>(parent).set_color(Color::Black);
                        link::<_, Tag>(grandparent).set_color(Color::Red);
                        self.rotate_left(grandparent);
                    }
                }
            }
            link::<_, Tag>(self.root.unwrap()).set_color(Color::Black);
        }
    }

    fn minimum(&self, mut n: NonNull<T>) -> NonNull<T> {
        unsafe {
            while let Some(l) = link::<_, Tag>(n).left.get() {
                n = l;
            }
            n
        }
    }

    fn transplant(&mut self, u: NonNull<T>, v: Option<NonNull<T>>) {
        unsafe {
            match link::<_, Tag>(u).parent() {
                None => self.root = v,
                Some(p) if link::<_, Tag>(p).left.get() == Some(u) => link::<_, Tag>(p).left.set(v),
                Some(p) => link::<_, Tag>(p).right.set(v),
            }
            if let Some(v) = v {
                link::<_, Tag>(v).set_parent(link::<_, Tag>(u).parent());
            }
        }
    }

    /// Remove `node` from the tree.
    ///
    /// # Safety
    ///
    /// `node` must currently be linked into this tree.
    pub unsafe fn remove(&mut self, z: NonNull<T>) {
        let mut y = z;
        let mut y_original_color = link::<_, Tag>(y).color();
        let x: Option<NonNull<T>>;
        let x_parent: Option<NonNull<T>>;

        if link::<_, Tag>(z).left.get().is_none() {
            x = link::<_, Tag>(z).right.get();
            x_parent = link::<_, Tag>(z).parent();
            self.transplant(z, x);
        } else if link::<_, Tag>(z).right.get().is_none() {
            x = link::<_, Tag>(z).left.get();
            x_parent = link::<_, Tag>(z).parent();
            self.transplant(z, x);
        } else {
            y = self.minimum(link::<_, Tag>(z).right.get().unwrap());
            y_original_color = link::<_, Tag>(y).color();
            x = link::<_, Tag>(y).right.get();
            if link::<_, Tag>(y).parent() == Some(z) {
                x_parent = Some(y);
            } else {
                x_parent = link::<_, Tag>(y).parent();
                self.transplant(y, x);
                link::<_, Tag>(y).right.set(link::<_, Tag>(z).right.get());
                link::<_, Tag>(link::<_, Tag>(y).right.get().unwrap()).set_parent(Some(y));
            }
            self.transplant(z, Some(y));
            link::<_, Tag>(y).left.set(link::<_, Tag>(z).left.get());
            link::<_, Tag>(link::<_, Tag>(y).left.get().unwrap()).set_parent(Some(y));
            link::<_, Tag>(y).set_color(link::<_, Tag>(z).color());
        }

        link::<_, Tag>(z).set_parent(None);
        link::<_, Tag>(z).left.set(None);
        link::<_, Tag>(z).right.set(None);
        self.len -= 1;

        if y_original_color == Color::Black {
            self.fix_remove(x, x_parent);
        }
    }

    fn fix_remove(&mut self, mut x: Option<NonNull<T>>, mut x_parent: Option<NonNull<T>>) {
        unsafe {
            while x != self.root && x.map(|n| link::<_, Tag>(n).color()) != Some(Color::Red) {
                let parent = match x_parent {
                    Some(p) => p,
                    None => break,
                };
                if x == link::<_, Tag>(parent).left.get() {
                    let mut w = link::<_, Tag>(parent).right.get().expect("sibling must exist");
                    if link::<_, Tag>(w).color() == Color::Red {
                        link::<_, Tag>(w).set_color(Color::Black);
                        link::<_, Tag>(parent).set_color(Color::Red);
                        self.rotate_left(parent);
                        w = link::<_, Tag>(parent).right.get().unwrap();
                    }
                    let wl_black = link::<_, Tag>(w).left.get().map(|n| link::<_, Tag>(n).color()) != Some(Color::Red);
                    let wr_black = link::<_, Tag>(w).right.get().map(|n| link::<_, Tag>(n).color()) != Some(Color::Red);
                    if wl_black && wr_black {
                        link::<_, Tag>(w).set_color(Color::Red);
                        x = Some(parent);
                        x_parent = link::<_, Tag>(parent).parent();
                    } else {
                        if wr_black {
                            if let Some(wl) = link::<_, Tag>(w).left.get() {
                                link::<_, Tag>(wl).set_color(Color::Black);
                            }
                            link::<_, Tag>(w).set_color(Color::Red);
                            self.rotate_right(w);
                            w = link::<_, Tag>(parent).right.get().unwrap();
                        }
                        link::<_, Tag>(w).set_color(link::<_, Tag>(parent).color());
                        link::<_, Tag>(parent).set_color(Color::Black);
                        if let Some(wr) = link::<_, Tag>(w).right.get() {
                            link::<_, Tag>(wr).set_color(Color::Black);
                        }
                        self.rotate_left(parent);
                        x = self.root;
                        x_parent = None;
                    }
                } else {
                    let mut w = link::<_, Tag>(parent).left.get().expect("sibling must exist");
                    if link::<_, Tag>(w).color() == Color::Red {
                        link::<_, Tag>(w).set_color(Color::Black);
                        link::<_, Tag>(parent).set_color(Color::Red);
                        self.rotate_right(parent);
                        w = link::<_, Tag>(parent).left.get().unwrap();
                    }
                    let wl_black = link::<_, Tag>(w).left.get().map(|n| link::<_, Tag>(n).color()) != Some(Color::Red);
                    let wr_black = link::<_, Tag>(w).right.get().map(|n| link::<_, Tag>(n).color()) != Some(Color::Red);
                    if wl_black && wr_black {
                        link::<_, Tag>(w).set_color(Color::Red);
                        x = Some(parent);
                        x_parent = link::<_, Tag>(parent).parent();
                    } else {
                        if wl_black {
                            if let Some(wr) = link::<_, Tag>(w).right.get() {
                                link::<_, Tag>(wr).set_color(Color::Black);
                            }
                            link::<_, Tag>(w).set_color(Color::Red);
                            self.rotate_left(w);
                            w = link::<_, Tag>(parent).left.get().unwrap();
                        }
                        link::<_, Tag>(w).set_color(link::<_, Tag>(parent).color());
                        link::<_, Tag>(parent).set_color(Color::Black);
                        if let Some(wl) = link::<_, Tag>(w).left.get() {
                            link::<_, Tag>(wl).set_color(Color::Black);
                        }
                        self.rotate_right(parent);
                        x = self.root;
                        x_parent = None;
                    }
                }
            }
            if let Some(x) = x {
                link::<_, Tag>(x).set_color(Color::Black);
            }
        }
    }

    /// The node with the smallest key, if any.
    pub fn first(&self) -> Option<NonNull<T>> {
        self.root.map(|r| self.minimum(r))
    }

    /// In-order successor of `node`, which must currently be linked into
    /// this tree.
    pub fn next(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        unsafe { successor::<T, Tag>(node) }
    }

    /// In-order predecessor of `node`, which must currently be linked into
    /// this tree.
    pub fn prev(&self, node: NonNull<T>) -> Option<NonNull<T>> {
        unsafe { predecessor::<T, Tag>(node) }
    }

    /// Smallest-keyed node whose key is >= `key` ("lower bound"), used by
    /// the hole-size tree's first-fit search.
    pub fn find_at_least(&self, key: &T::Key) -> Option<NonNull<T>> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(node) = cur {
            let node_key = unsafe { node.as_ref().key() };
            if &node_key >= key {
                best = Some(node);
                cur = unsafe { link::<_, Tag>(node).left.get() };
            } else {
                cur = unsafe { link::<_, Tag>(node).right.get() };
            }
        }
        best
    }

    /// Largest-keyed node whose key is <= `key` ("predecessor or equal"),
    /// used to locate the mapping containing (or immediately before) an
    /// address.
    pub fn find_at_most(&self, key: &T::Key) -> Option<NonNull<T>> {
        let mut cur = self.root;
        let mut best = None;
        while let Some(node) = cur {
            let node_key = unsafe { node.as_ref().key() };
            if &node_key <= key {
                best = Some(node);
                cur = unsafe { link::<_, Tag>(node).right.get() };
            } else {
                cur = unsafe { link::<_, Tag>(node).left.get() };
            }
        }
        best
    }

    /// In-order iterator.
    pub fn iter(&self) -> IterInOrder<T, Tag> {
        IterInOrder {
            next: self.first(),
            _tag: core::marker::PhantomData,
        }
    }
}

/// In-order iterator over an [`RbTree`].
pub struct IterInOrder<T: RbNode<Tag>, Tag = ()> {
    next: Option<NonNull<T>>,
    _tag: core::marker::PhantomData<Tag>,
}

impl<T: RbNode<Tag>, Tag> Iterator for IterInOrder<T, Tag> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = unsafe { successor::<T, Tag>(current) };
        Some(current)
    }
}

unsafe fn successor<T: RbNode<Tag>, Tag>(n: NonNull<T>) -> Option<NonNull<T>> {
    if let Some(mut r) = link::<_, Tag>(n).right.get() {
        while let Some(l) = link::<_, Tag>(r).left.get() {
            r = l;
        }
        return Some(r);
    }
    let mut n = n;
    let mut p = link::<_, Tag>(n).parent();
    while let Some(parent) = p {
        if link::<_, Tag>(parent).left.get() == Some(n) {
            return Some(parent);
        }
        n = parent;
        p = link::<_, Tag>(n).parent();
    }
    None
}

unsafe fn predecessor<T: RbNode<Tag>, Tag>(n: NonNull<T>) -> Option<NonNull<T>> {
    if let Some(mut l) = link::<_, Tag>(n).left.get() {
        while let Some(r) = link::<_, Tag>(l).right.get() {
            l = r;
        }
        return Some(l);
    }
    let mut n = n;
    let mut p = link::<_, Tag>(n).parent();
    while let Some(parent) = p {
        if link::<_, Tag>(parent).right.get() == Some(n) {
            return Some(parent);
        }
        n = parent;
        p = link::<_, Tag>(n).parent();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        key: i32,
        link: RbLink<Node>,
    }

    impl RbNode for Node {
        type Key = i32;

        fn link(&self) -> &RbLink<Node> {
            &self.link
        }

        fn key(&self) -> i32 {
            self.key
        }
    }

    fn leak(key: i32) -> NonNull<Node> {
        let boxed = alloc_node(key);
        NonNull::new(boxed).unwrap()
    }

    // Test-only "allocator": a fixed backing array keeps this free of
    // `alloc`, matching the rest of the crate.
    fn alloc_node(key: i32) -> *mut Node {
        use core::cell::UnsafeCell;
        const N: usize = 64;
        static STORAGE: UnsafeCell<[Option<Node>; N]> =
            UnsafeCell::new([const { None }; N]);
        static NEXT: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        let idx = NEXT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        assert!(idx < N, "test node storage exhausted");
        unsafe {
            let slot = &mut (*STORAGE.get())[idx];
            *slot = Some(Node { key, link: RbLink::new() });
            slot.as_mut().unwrap() as *mut Node
        }
    }

    #[test]
    fn insert_and_iterate_sorted() {
        let mut tree: RbTree<Node> = RbTree::new();
        for k in [5, 3, 8, 1, 4, 7, 9, 2, 6] {
            let n = leak(k);
            unsafe { tree.insert(n) };
        }

        let mut prev = i32::MIN;
        let mut count = 0;
        for n in tree.iter() {
            let k = unsafe { n.as_ref().key };
            assert!(k > prev);
            prev = k;
            count += 1;
        }
        assert_eq!(count, 9);
        assert_eq!(tree.len(), 9);
    }

    #[test]
    fn find_locates_existing_key() {
        let mut tree: RbTree<Node> = RbTree::new();
        for k in [10, 20, 30, 40, 50] {
            unsafe { tree.insert(leak(k)) };
        }
        let found = tree.find(&30).expect("30 must be present");
        assert_eq!(unsafe { found.as_ref().key }, 30);
        assert!(tree.find(&31).is_none());
    }

    #[test]
    fn remove_keeps_remaining_sorted() {
        let mut tree: RbTree<Node> = RbTree::new();
        let mut handles = [None; 7];
        for (i, k) in [40, 20, 60, 10, 30, 50, 70].into_iter().enumerate() {
            let n = leak(k);
            handles[i] = Some(n);
            unsafe { tree.insert(n) };
        }

        unsafe { tree.remove(handles[1].unwrap()) }; // remove 20

        let mut prev = i32::MIN;
        let mut count = 0;
        for n in tree.iter() {
            let k = unsafe { n.as_ref().key };
            assert!(k > prev);
            assert_ne!(k, 20);
            prev = k;
            count += 1;
        }
        assert_eq!(count, 6);
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn find_at_least_and_at_most_bracket_missing_keys() {
        let mut tree: RbTree<Node> = RbTree::new();
        for k in [10, 20, 30, 40] {
            unsafe { tree.insert(leak(k)) };
        }
        assert_eq!(unsafe { tree.find_at_least(&25).unwrap().as_ref().key }, 30);
        assert_eq!(unsafe { tree.find_at_most(&25).unwrap().as_ref().key }, 20);
        assert_eq!(unsafe { tree.find_at_least(&10).unwrap().as_ref().key }, 10);
        assert!(tree.find_at_least(&41).is_none());
        assert!(tree.find_at_most(&9).is_none());
    }

    #[test]
    fn next_and_prev_walk_in_order() {
        let mut tree: RbTree<Node> = RbTree::new();
        let mut handles = [None; 5];
        for (i, k) in [10, 20, 30, 40, 50].into_iter().enumerate() {
            let n = leak(k);
            handles[i] = Some(n);
            unsafe { tree.insert(n) };
        }
        let middle = handles[2].unwrap();
        assert_eq!(unsafe { tree.next(middle).unwrap().as_ref().key }, 40);
        assert_eq!(unsafe { tree.prev(middle).unwrap().as_ref().key }, 20);
        assert!(tree.next(handles[4].unwrap()).is_none());
        assert!(tree.prev(handles[0].unwrap()).is_none());
    }
}
