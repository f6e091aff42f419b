//! The walk-or-create primitive.
//!
//! Every operation on a translation tree goes through [`walk`]: it descends
//! from the root table to the entry that maps `va`, one [`Step`] per
//! intermediate level, optionally creating missing tables on the way.

use crate::{FrameAlloc, PageEntry, PageFlags, PhysMapper, TableLevel, table_mut};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalkError {
    /// The entry at this level is not present.
    #[error("no entry present at {0:?}")]
    Absent(TableLevel),
    /// No frame was available for a new table at this level.
    #[error("out of physical frames while creating a {0:?} table")]
    OutOfMemory(TableLevel),
    /// A huge-page leaf at this level covers the address.
    #[error("address is covered by a huge page at {0:?}")]
    HugePage(TableLevel),
}

/// Result of descending through one intermediate entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// The entry already pointed to this table.
    Present(PhysicalFrame),
    /// The table was missing and has just been allocated, zeroed and linked.
    Allocated(PhysicalFrame),
    /// The entry is a huge-page leaf.
    Huge,
    /// The entry is not present and nothing was created.
    Absent,
}

/// What to do about missing tables.
pub enum Mode<'a, A> {
    /// Never modify the tree.
    Lookup,
    /// Allocate missing tables from `alloc` and link them with `table_flags`.
    Create {
        alloc: &'a mut A,
        table_flags: PageFlags,
    },
}

/// The entry that maps an address, as found by [`walk`].
pub struct LeafSlot<'a> {
    entry: &'a mut PageEntry,
    level: TableLevel,
    allocated: usize,
}

impl LeafSlot<'_> {
    #[inline]
    #[must_use]
    pub fn entry(&self) -> PageEntry {
        *self.entry
    }

    #[inline]
    pub fn set(&mut self, entry: PageEntry) {
        *self.entry = entry;
    }

    /// [`TableLevel::Pt`] for a 4 KiB leaf, higher for a huge page.
    #[inline]
    #[must_use]
    pub const fn level(&self) -> TableLevel {
        self.level
    }

    /// Number of intermediate tables created by this walk.
    #[inline]
    #[must_use]
    pub const fn tables_allocated(&self) -> usize {
        self.allocated
    }
}

/// Allocator for walks that must never allocate.
struct NoFrames;

impl FrameAlloc for NoFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalFrame> {
        None
    }

    fn free_4k(&mut self, _frame: PhysicalFrame) {}
}

/// Descend through the entry for `va` in `table` (a table at `level`).
///
/// # Safety
/// `table` must be a translation table reachable through `m`.
unsafe fn descend<M: PhysMapper, A: FrameAlloc>(
    m: &M,
    table: PhysicalFrame,
    level: TableLevel,
    va: VirtualAddress,
    mode: &mut Mode<'_, A>,
) -> Result<Step, WalkError> {
    let t = unsafe { table_mut(m, table) };
    let idx = level.index_of(va);
    let e = t.get(idx);

    if e.present() {
        if e.huge_page() {
            return if level.allows_huge() {
                Ok(Step::Huge)
            } else {
                Err(WalkError::HugePage(level))
            };
        }
        if let Mode::Create { table_flags, .. } = mode
            && table_flags.contains(PageFlags::USER)
            && !e.user()
        {
            t.set(idx, e.with_user(true));
        }
        return Ok(Step::Present(e.frame()));
    }

    let Mode::Create { alloc, table_flags } = mode else {
        return Ok(Step::Absent);
    };

    let child = level.next().unwrap_or(level);
    let frame = alloc.alloc_4k().ok_or(WalkError::OutOfMemory(child))?;
    unsafe { m.zero_frame(frame) };
    t.set(idx, PageEntry::mapping(frame, *table_flags));
    log::trace!("walk: new {child:?} table {frame:?} for {va}");
    Ok(Step::Allocated(frame))
}

/// Walk the tree rooted at `root` down to the entry that maps `va`.
///
/// In [`Mode::Lookup`] a huge-page leaf ends the walk early and is returned as
/// the slot. In [`Mode::Create`] a huge page is an error since a 4 KiB leaf
/// cannot be placed below it.
///
/// Tables created before a failing allocation stay linked and empty.
///
/// # Safety
/// - `root` must be a translation table reachable through `m`.
/// - The returned slot borrows table memory for `'a`; no other reference to
///   that table may be created while it is alive.
pub unsafe fn walk<'a, M: PhysMapper, A: FrameAlloc>(
    m: &M,
    root: PhysicalFrame,
    va: VirtualAddress,
    mut mode: Mode<'_, A>,
) -> Result<LeafSlot<'a>, WalkError> {
    let creating = matches!(mode, Mode::Create { .. });
    let mut table = root;
    let mut allocated = 0;

    for level in [TableLevel::Pml4, TableLevel::Pdpt, TableLevel::Pd] {
        match unsafe { descend(m, table, level, va, &mut mode) }? {
            Step::Present(next) => table = next,
            Step::Allocated(next) => {
                allocated += 1;
                table = next;
            }
            Step::Huge if creating => return Err(WalkError::HugePage(level)),
            Step::Huge => {
                let t = unsafe { table_mut(m, table) };
                return Ok(LeafSlot {
                    entry: t.entry_mut(level.index_of(va)),
                    level,
                    allocated,
                });
            }
            Step::Absent => return Err(WalkError::Absent(level)),
        }
    }

    let t = unsafe { table_mut(m, table) };
    Ok(LeafSlot {
        entry: t.entry_mut(TableLevel::Pt.index_of(va)),
        level: TableLevel::Pt,
        allocated,
    })
}

/// [`walk`] in [`Mode::Lookup`].
///
/// # Safety
/// Same as [`walk`].
pub unsafe fn lookup<'a, M: PhysMapper>(
    m: &M,
    root: PhysicalFrame,
    va: VirtualAddress,
) -> Result<LeafSlot<'a>, WalkError> {
    unsafe { walk(m, root, va, Mode::<NoFrames>::Lookup) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{BumpAlloc, TestPhys};

    fn setup() -> (TestPhys, BumpAlloc, PhysicalFrame) {
        let phys = TestPhys::with_frames(32);
        let mut alloc = BumpAlloc::new(1, 32);
        let root = alloc.alloc_4k().unwrap();
        (phys, alloc, root)
    }

    #[test]
    fn lookup_on_empty_tree_is_absent_at_root() {
        let (phys, _alloc, root) = setup();
        let r = unsafe { lookup(&phys, root, VirtualAddress::new(0x40_0000)) };
        assert_eq!(r.err(), Some(WalkError::Absent(TableLevel::Pml4)));
    }

    #[test]
    fn create_allocates_three_tables_once() {
        let (phys, mut alloc, root) = setup();
        let va = VirtualAddress::new(0x40_0000);

        let slot = unsafe {
            walk(
                &phys,
                root,
                va,
                Mode::Create {
                    alloc: &mut alloc,
                    table_flags: PageFlags::for_table(PageFlags::KERNEL_DATA),
                },
            )
        }
        .unwrap();
        assert_eq!(slot.tables_allocated(), 3);
        assert_eq!(slot.level(), TableLevel::Pt);
        assert!(!slot.entry().present());

        // a neighbouring page reuses the same chain
        let slot = unsafe {
            walk(
                &phys,
                root,
                va + 0x1000,
                Mode::Create {
                    alloc: &mut alloc,
                    table_flags: PageFlags::for_table(PageFlags::KERNEL_DATA),
                },
            )
        }
        .unwrap();
        assert_eq!(slot.tables_allocated(), 0);
        assert_eq!(alloc.allocated(1), 4);
    }

    #[test]
    fn create_reports_exhaustion_level() {
        let phys = TestPhys::with_frames(4);
        let mut alloc = BumpAlloc::new(1, 3);
        let root = alloc.alloc_4k().unwrap();

        let r = unsafe {
            walk(
                &phys,
                root,
                VirtualAddress::new(0x1000),
                Mode::Create {
                    alloc: &mut alloc,
                    table_flags: PageFlags::PRESENT | PageFlags::WRITABLE,
                },
            )
        };
        assert_eq!(r.err(), Some(WalkError::OutOfMemory(TableLevel::Pd)));
    }

    #[test]
    fn huge_leaf_stops_lookup_and_blocks_create() {
        let (phys, mut alloc, root) = setup();
        let va = VirtualAddress::new(0x20_0000);
        let flags = PageFlags::for_table(PageFlags::KERNEL_DATA);

        // build PML4 -> PDPT -> PD, then turn the PD entry into a 2 MiB leaf
        let mut slot = unsafe {
            walk(&phys, root, va, Mode::Create { alloc: &mut alloc, table_flags: flags })
        }
        .unwrap();
        slot.set(PageEntry::new());
        let pml4 = unsafe { table_mut(&phys, root) };
        let pdpt = unsafe { table_mut(&phys, pml4.get(0).frame()) };
        let pd = unsafe { table_mut(&phys, pdpt.get(0).frame()) };
        pd.set(
            1,
            PageEntry::mapping(
                PhysicalFrame::from_index(0x200),
                PageFlags::PRESENT | PageFlags::HUGE_PAGE,
            ),
        );

        let slot = unsafe { lookup(&phys, root, va + 0x1234) }.unwrap();
        assert_eq!(slot.level(), TableLevel::Pd);
        assert_eq!(slot.entry().frame().index(), 0x200);

        let r = unsafe {
            walk(&phys, root, va, Mode::Create { alloc: &mut alloc, table_flags: flags })
        };
        assert_eq!(r.err(), Some(WalkError::HugePage(TableLevel::Pd)));
    }

    #[test]
    fn user_request_upgrades_existing_tables() {
        let (phys, mut alloc, root) = setup();
        let va = VirtualAddress::new(0x1000);
        unsafe {
            walk(
                &phys,
                root,
                va,
                Mode::Create {
                    alloc: &mut alloc,
                    table_flags: PageFlags::for_table(PageFlags::KERNEL_DATA),
                },
            )
        }
        .unwrap();
        assert!(!unsafe { table_mut(&phys, root) }.get(0).user());

        unsafe {
            walk(
                &phys,
                root,
                va,
                Mode::Create {
                    alloc: &mut alloc,
                    table_flags: PageFlags::for_table(PageFlags::PRESENT | PageFlags::USER),
                },
            )
        }
        .unwrap();
        assert!(unsafe { table_mut(&phys, root) }.get(0).user());
    }
}
