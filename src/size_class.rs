//! Size class table and lookup.
//!
//! Blocks are bucketed into 73 size classes: 29 small (16 byte steps up
//! to 4KiB, hosted on 64KiB pages), 24 medium (up to 256KiB on 4MiB
//! pages) and 20 large (up to 8MiB on 64MiB pages). Above the first
//! eight granularity multiples, class spacing follows a
//! (mantissa, exponent) scheme with two subclass bits, bounding internal
//! fragmentation near 20%.

use crate::types::{
    PageType, SizeClass, LARGE_PAGE_SIZE, MEDIUM_PAGE_SIZE, MEDIUM_SIZE_CLASS_COUNT,
    PAGE_HEADER_SIZE, SIZE_CLASS_COUNT, SMALL_GRANULARITY, SMALL_PAGE_SIZE,
    SMALL_SIZE_CLASS_COUNT,
};

/// Granularity multiple for a class index. Classes 0..=8 step linearly
/// (class 0 is a duplicate of class 1, kept so the index math below
/// never yields class 0); higher classes decompose into a power-of-two
/// exponent and two subclass bits.
const fn class_granularity_multiple(class: usize) -> usize {
    if class == 0 {
        return 1;
    }
    if class <= 8 {
        return class;
    }
    let exponent = (class + 3) >> 2;
    let subclass = (class + 3) & 0x03;
    (5 + subclass) << (exponent - 2)
}

const fn build_size_classes() -> [SizeClass; SIZE_CLASS_COUNT] {
    let mut classes = [SizeClass {
        block_size: 0,
        block_count: 0,
    }; SIZE_CLASS_COUNT];
    let mut class = 0;
    while class < SIZE_CLASS_COUNT {
        let block_size = class_granularity_multiple(class) * SMALL_GRANULARITY;
        let page_size = if class < SMALL_SIZE_CLASS_COUNT {
            SMALL_PAGE_SIZE
        } else if class < SMALL_SIZE_CLASS_COUNT + MEDIUM_SIZE_CLASS_COUNT {
            MEDIUM_PAGE_SIZE
        } else {
            LARGE_PAGE_SIZE
        };
        classes[class] = SizeClass {
            block_size: block_size as u32,
            block_count: ((page_size - PAGE_HEADER_SIZE) / block_size) as u32,
        };
        class += 1;
    }
    classes
}

/// The size class table, precomputed for all 73 classes.
pub static SIZE_CLASSES: [SizeClass; SIZE_CLASS_COUNT] = build_size_classes();

/// Get the size class from a given size in bytes. Sizes above
/// `LARGE_BLOCK_SIZE_LIMIT` produce an out of range index and must be
/// routed to the huge path by the caller before any table access.
#[inline]
pub fn size_class_of(size: usize) -> u32 {
    let minblock_count = (size + SMALL_GRANULARITY - 1) / SMALL_GRANULARITY;
    // For sizes up to 8 times the granularity the class equals the
    // number of granularity blocks
    if minblock_count <= 8 {
        return if minblock_count != 0 {
            minblock_count as u32
        } else {
            1
        };
    }
    let minblock_count = minblock_count - 1;
    // minblock_count > 8 guarantees the most significant bit position
    // is >= 3; the two bits below it select the subclass
    let most_significant_bit = usize::BITS - 1 - minblock_count.leading_zeros();
    let subclass = ((minblock_count >> (most_significant_bit - 2)) & 0x03) as u32;
    (most_significant_bit << 2) + subclass - 3
}

/// Page type hosting the given size class.
#[inline]
pub fn page_type_of(size_class: u32) -> PageType {
    if (size_class as usize) < SMALL_SIZE_CLASS_COUNT {
        PageType::Small
    } else if (size_class as usize) < SMALL_SIZE_CLASS_COUNT + MEDIUM_SIZE_CLASS_COUNT {
        PageType::Medium
    } else if (size_class as usize) < SIZE_CLASS_COUNT {
        PageType::Large
    } else {
        PageType::Huge
    }
}

/// Page size for a pooled page type.
#[inline]
pub fn page_size_of(page_type: PageType) -> usize {
    match page_type {
        PageType::Small => SMALL_PAGE_SIZE,
        PageType::Medium => MEDIUM_PAGE_SIZE,
        _ => LARGE_PAGE_SIZE,
    }
}
