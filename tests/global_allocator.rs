#![cfg(unix)]

use std::alloc::{Layout, alloc, dealloc, realloc};
use std::collections::HashMap;
use std::thread;

use tagheap::GlobalHeap;

#[global_allocator]
static GLOBAL: GlobalHeap = GlobalHeap::new();

#[test]
fn collections_work() {
  let b = Box::new(42u64);
  assert_eq!(*b, 42);

  let v: Vec<u32> = (0..10_000).collect();
  assert_eq!(v[9_999], 9_999);

  let s = format!("{}-{}", "tag", "heap");
  assert_eq!(s, "tag-heap");

  let mut m = HashMap::new();
  for i in 0..1000 {
    m.insert(i, i.to_string());
  }
  assert_eq!(m[&500], "500");
}

#[test]
fn zero_sized_and_growing_vectors() {
  let mut v: Vec<()> = Vec::new();
  for _ in 0..100 {
    v.push(());
  }
  assert_eq!(v.len(), 100);

  let mut bytes = Vec::new();
  for i in 0..100_000u32 {
    bytes.push(i as u8);
  }
  assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
}

#[test]
fn over_aligned_layouts() {
  for align in [32, 64, 128, 4096] {
    unsafe {
      let layout = Layout::from_size_align(200, align).unwrap();
      let ptr = alloc(layout);
      assert!(!ptr.is_null());
      assert_eq!(ptr as usize % align, 0, "alignment {align}");
      ptr.write_bytes(0x3c, 200);

      let grown = realloc(ptr, layout, 5000);
      assert!(!grown.is_null());
      assert_eq!(grown as usize % align, 0);
      assert!((0..200).all(|i| grown.add(i).read() == 0x3c));
      dealloc(grown, Layout::from_size_align(5000, align).unwrap());
    }
  }
}

#[test]
fn realloc_preserves_contents() {
  unsafe {
    let layout = Layout::from_size_align(64, 8).unwrap();
    let ptr = alloc(layout);
    for i in 0..64 {
      ptr.add(i).write(i as u8);
    }
    let bigger = realloc(ptr, layout, 10_000);
    assert!((0..64).all(|i| bigger.add(i).read() == i as u8));
    let smaller = realloc(bigger, Layout::from_size_align(10_000, 8).unwrap(), 16);
    assert_eq!(smaller, bigger);
    assert!((0..16).all(|i| smaller.add(i).read() == i as u8));
    dealloc(smaller, Layout::from_size_align(16, 8).unwrap());
  }
}

#[test]
fn threads_share_the_heap() {
  let handles: Vec<_> = (0..4)
    .map(|t| {
      thread::spawn(move || {
        let mut live = Vec::new();
        for i in 0..2000 {
          live.push(vec![t as u8; 1 + (i * 13) % 700]);
          if i % 3 == 0 {
            live.swap_remove(i % live.len());
          }
        }
        live.iter().all(|v| v.iter().all(|&b| b == t as u8))
      })
    })
    .collect();
  for h in handles {
    assert!(h.join().unwrap());
  }
}

#[test]
fn heap_is_inspectable() {
  let _keep = vec![1u8; 300];
  let pages = GLOBAL.with_heap(|heap| {
    heap.verify().unwrap();
    heap.pages()
  });
  assert!(pages.unwrap() >= 1);
}

#[test]
fn allocates_with_a_trace_logger_installed() {
  let _ = env_logger::builder()
    .is_test(true)
    .filter_level(log::LevelFilter::Trace)
    .try_init();
  log::trace!("logger installed");

  let mut live = Vec::new();
  for i in 0..200 {
    live.push(vec![1u8; 100 + i * 50]);
  }
  assert!(live.iter().all(|v| v.iter().all(|&b| b == 1)));
  drop(live);

  let big = vec![7u8; 1 << 20];
  assert_eq!(big[(1 << 20) - 1], 7);
  GLOBAL.with_heap(|heap| heap.verify()).unwrap().unwrap();
}
