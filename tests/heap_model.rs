//! Random operation sequences against a heap, checking invariants and payload integrity.

use std::ptr::NonNull;

use proptest::prelude::*;
use tagheap::{AllocError, Heap, PAGE_SIZE, SliceArena};

const PAGES: usize = 48;

#[derive(Debug, Clone)]
enum Op {
  Allocate(usize),
  AllocateLarge(usize),
  Aligned(usize, u32),
  Release(usize),
  Resize(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    4 => (1usize..=200).prop_map(Op::Allocate),
    2 => (200usize..=6000).prop_map(Op::AllocateLarge),
    1 => ((1usize..=300), (5u32..=10)).prop_map(|(size, shift)| Op::Aligned(size, shift)),
    4 => any::<usize>().prop_map(Op::Release),
    2 => (any::<usize>(), 0usize..=3000).prop_map(|(i, size)| Op::Resize(i, size)),
  ]
}

struct Live {
  ptr: *mut u8,
  size: usize,
  fill: u8,
}

impl Live {
  fn stamp(&self) {
    unsafe { self.ptr.write_bytes(self.fill, self.size) };
  }

  fn intact(&self) -> bool {
    (0..self.size).all(|i| unsafe { self.ptr.add(i).read() } == self.fill)
  }
}

fn track(
  result: Result<Option<NonNull<u8>>, AllocError>,
  size: usize,
  fill: u8,
  live: &mut Vec<Live>,
) {
  match result {
    Ok(Some(p)) => {
      let block = Live {
        ptr: p.as_ptr(),
        size,
        fill,
      };
      block.stamp();
      live.push(block);
    }
    Ok(None) => unreachable!("non-zero request returned no block"),
    Err(err) => assert!(matches!(err, AllocError::OutOfMemory { .. }), "{err}"),
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(128))]

  #[test]
  fn random_workload_keeps_heap_consistent(ops in prop::collection::vec(op(), 1..200)) {
    let mut buf = vec![0u8; PAGES * PAGE_SIZE + 16];
    let mut heap = Heap::new(SliceArena::new(&mut buf));
    let mut live: Vec<Live> = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
      let fill = (step % 251) as u8 + 1;
      match op {
        Op::Allocate(size) | Op::AllocateLarge(size) => {
          track(heap.allocate(size), size, fill, &mut live);
        }
        Op::Aligned(size, shift) => {
          let align = 1usize << shift;
          let result = heap.aligned_allocate(size, align);
          if let Ok(Some(p)) = result {
            prop_assert_eq!(p.as_ptr() as usize % align, 0);
          }
          track(result, size, fill, &mut live);
        }
        Op::Release(i) if !live.is_empty() => {
          let block = live.swap_remove(i % live.len());
          prop_assert!(block.intact());
          unsafe { heap.release(block.ptr) };
        }
        Op::Resize(i, size) if !live.is_empty() => {
          let index = i % live.len();
          prop_assert!(live[index].intact());
          let old = &live[index];
          match unsafe { heap.resize(old.ptr, size) } {
            Ok(None) => {
              prop_assert_eq!(size, 0);
              live.swap_remove(index);
            }
            Ok(Some(p)) => {
              let kept = old.size.min(size);
              let fill = old.fill;
              let preserved = (0..kept).all(|j| unsafe { p.as_ptr().add(j).read() } == fill);
              prop_assert!(preserved, "resize lost payload bytes");
              let block = Live { ptr: p.as_ptr(), size, fill: old.fill };
              block.stamp();
              live[index] = block;
            }
            Err(err) => {
              let out_of_memory = matches!(err, AllocError::OutOfMemory { .. });
              prop_assert!(out_of_memory, "unexpected resize error: {}", err);
              prop_assert!(live[index].intact());
            }
          }
        }
        Op::Release(_) | Op::Resize(..) => {}
      }

      if let Err(corruption) = heap.verify() {
        return Err(TestCaseError::fail(format!("step {step}: {corruption}")));
      }
      for block in &live {
        prop_assert_eq!(heap.check(block.ptr), Ok(()));
        prop_assert!(heap.usable_size(block.ptr).unwrap() >= block.size);
      }
    }

    prop_assert!(live.iter().all(Live::intact));
    for block in live.drain(..) {
      unsafe { heap.release(block.ptr) };
    }
    heap.verify().unwrap();
    // Only quick-listed blocks stay marked allocated once everything is released.
    for info in heap.blocks().filter(|b| b.allocated) {
      prop_assert!(info.size <= 176, "{}", info);
    }
  }
}
