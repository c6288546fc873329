//! Basic integration test: install spanalloc as the global allocator
//! and exercise standard Rust collections.

use spanalloc::SpanAlloc;

#[global_allocator]
static GLOBAL: SpanAlloc = SpanAlloc;

#[test]
fn test_box() {
    let boxed = Box::new(42u64);
    assert_eq!(*boxed, 42);
    drop(boxed);
}

#[test]
fn test_vec() {
    let mut values = Vec::new();
    for value in 0..1000 {
        values.push(value);
    }
    assert_eq!(values.len(), 1000);
    assert_eq!(values[500], 500);
    values.clear();
}

#[test]
fn test_string() {
    let mut text = String::new();
    for _ in 0..100 {
        text.push_str("hello world ");
    }
    assert!(text.len() > 100);
}

#[test]
fn test_hashmap() {
    use std::collections::HashMap;
    let mut map = HashMap::new();
    for key in 0..500 {
        map.insert(key, format!("value_{}", key));
    }
    assert_eq!(map.len(), 500);
    assert_eq!(map[&42], "value_42");
}

#[test]
fn test_vec_of_strings() {
    let items: Vec<String> = (0..200).map(|index| format!("item_{}", index)).collect();
    assert_eq!(items.len(), 200);
    assert_eq!(items[100], "item_100");
}

#[test]
fn test_nested_collections() {
    let mut outer: Vec<Vec<u32>> = Vec::new();
    for count in 0..50 {
        let inner: Vec<u32> = (0..count).collect();
        outer.push(inner);
    }
    assert_eq!(outer[49].len(), 49);
}

#[test]
fn test_large_allocation() {
    // Above the medium block limit, served from a large page
    let bytes: Vec<u8> = vec![0xAB; 512 * 1024];
    assert_eq!(bytes.len(), 512 * 1024);
    assert!(bytes.iter().all(|&byte| byte == 0xAB));
}

#[test]
fn test_huge_allocation() {
    // Above the large block limit, served from its own span
    let bytes: Vec<u8> = vec![0x5A; 16 * 1024 * 1024];
    assert_eq!(bytes.len(), 16 * 1024 * 1024);
    assert_eq!(bytes[0], 0x5A);
    assert_eq!(bytes[16 * 1024 * 1024 - 1], 0x5A);
}

#[test]
fn test_various_sizes() {
    let _a: Box<[u8; 1]> = Box::new([0; 1]);
    let _b: Box<[u8; 8]> = Box::new([0; 8]);
    let _c: Box<[u8; 16]> = Box::new([0; 16]);
    let _d: Box<[u8; 64]> = Box::new([0; 64]);
    let _e: Box<[u8; 256]> = Box::new([0; 256]);
    let _f: Box<[u8; 1024]> = Box::new([0; 1024]);
    let _g: Box<[u8; 4096]> = Box::new([0; 4096]);
    let _h: Box<[u8; 8192]> = Box::new([0; 8192]);
    let _i: Box<[u8; 65536]> = Box::new([0; 65536]);
}

#[test]
fn test_alloc_free_cycle() {
    for _ in 0..100 {
        let values: Vec<u64> = (0..100).collect();
        assert_eq!(values.len(), 100);
        drop(values);
    }
}

#[test]
fn test_vec_growth_reallocates() {
    let mut values: Vec<u64> = Vec::with_capacity(8);
    for value in 0..100_000u64 {
        values.push(value);
    }
    for probe in [0usize, 1, 99_998, 99_999] {
        assert_eq!(values[probe], probe as u64);
    }
}
