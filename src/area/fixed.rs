/*!

Fixed-length allocation. Every cell of a fixed-length area has the same length, so free cells are kept on one
singly linked freelist: the first word of a free cell holds the offset of the next free cell, and zero ends the list.
Allocation pops the head, freeing pushes onto it. When the list runs dry a new subarea is taken and all its cells
are threaded onto the list at once.

*/

use tracing::{debug, trace};

use crate::{
  area::{Area, AreaHeader},
  error::{AllocationError, Result},
  segment::{layout::*, memory::SegmentMemory}
};

impl Area<'_> {
  pub(crate) fn allocate_fixed(&mut self) -> Result<Offset> {
    let mut cell = self.header.freelist(self.memory);
    if cell == 0 {
      self.extend_fixed()?;
      cell = self.header.freelist(self.memory);
      if cell == 0 {
        return Err(AllocationError::SegmentExhausted { requested: self.object_length() as usize, available: 0 });
      }
    }

    let next = self.read(cell);
    self.header.set_freelist(self.memory, next);
    trace!(area = %self.kind, cell, "allocated cell");
    Ok(cell)
  }

  pub(crate) fn free_fixed(&mut self, cell: Offset) -> Result<()> {
    let length  = self.object_length();
    let subarea = self.header.subarea_containing(self.memory, cell)
        .ok_or_else(|| self.corrupt(cell, "cell lies outside every subarea of the area"))?;
    let start   = subarea.aligned_offset(self.memory);
    let cells   = subarea.aligned_size(self.memory) / length;

    if (cell - start) % length != 0 || (cell - start) / length >= cells {
      return Err(self.corrupt(cell, "offset is not a cell boundary"));
    }

    let head = self.header.freelist(self.memory);
    self.write(cell, head);
    self.header.set_freelist(self.memory, cell);
    trace!(area = %self.kind, cell, "freed cell");
    Ok(())
  }

  /// Adds a subarea sized by the growth policy and threads its cells onto the freelist.
  fn extend_fixed(&mut self) -> Result<()> {
    let index   = self.next_subarea_index()?;
    let size    = self.next_subarea_size(self.object_length() + SUBAREA_ALIGNMENT_BYTES)?;
    let subarea = self.create_subarea(index, size)?;
    self.initialize_free_span(subarea);

    debug!(area = %self.kind, index, size, "extended fixed-length area");
    Ok(())
  }

  /// Threads every whole cell of `size` bytes starting at `start` onto the freelist, first cell first.
  pub(crate) fn thread_freelist(&mut self, start: Offset, size: Word) {
    let length = self.object_length();
    let cells  = size / length;
    if cells == 0 {
      return;
    }

    let mut tail = self.header.freelist(self.memory);
    for i in (0..cells).rev() {
      let cell = start + i * length;
      self.write(cell, tail);
      tail = cell;
    }
    self.header.set_freelist(self.memory, tail);
  }

  #[inline(always)]
  pub(crate) fn object_length(&self) -> Word {
    self.header.object_length(self.memory)
  }
}

impl AreaHeader {
  /// Number of cells on the freelist, bounded by the area's capacity.
  pub fn freelist_len(self, memory: &SegmentMemory) -> usize {
    let length = self.object_length(memory).max(1);
    let capacity: usize = self.subareas(memory)
        .map(|subarea| (subarea.aligned_size(memory) / length) as usize)
        .sum();

    let mut count = 0;
    let mut cell  = self.freelist(memory);
    while cell != 0 && count <= capacity {
      count += 1;
      cell   = match memory.try_read_word(cell) {
        Some(next) => next,
        None       => break,
      };
    }
    count
  }
}
