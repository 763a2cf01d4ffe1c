use crate::util::constants::*;

/* Alignment */

// `align` need not be a power of two.

pub const fn align_up_to(val: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    val.div_ceil(align) * align
}

pub const fn align_down_to(val: usize, align: usize) -> usize {
    debug_assert!(align > 0);
    val / align * align
}

pub const fn is_aligned_to(val: usize, align: usize) -> bool {
    debug_assert!(align > 0);
    val % align == 0
}

/* Conversion */

pub const fn words_to_bytes(words: usize) -> usize {
    words << LOG_BYTES_IN_WORD
}

pub fn bytes_to_formatted_string(bytes: usize) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut i = 0;
    let mut num = bytes;
    while i < UNITS.len() - 1 {
        let new_num = num >> 10;
        if new_num == 0 {
            return format!("{}{}", num, UNITS[i]);
        }
        num = new_num;
        i += 1;
    }
    format!("{}{}", num, UNITS[UNITS.len() - 1])
}

#[cfg(test)]
mod tests {
    use crate::util::conversions::*;

    #[test]
    fn test_align_non_power_of_two() {
        assert_eq!(align_up_to(0, 40), 0);
        assert_eq!(align_up_to(1, 40), 40);
        assert_eq!(align_up_to(80, 40), 80);
        assert_eq!(align_down_to(119, 40), 80);
        assert!(is_aligned_to(120, 40));
        assert!(!is_aligned_to(100, 40));
    }

    #[test]
    fn test_words_bytes() {
        assert_eq!(words_to_bytes(3), 3 * BYTES_IN_WORD);
    }

    #[test]
    fn test_bytes_to_formatted_string() {
        assert_eq!(bytes_to_formatted_string(0), "0B");
        assert_eq!(bytes_to_formatted_string(1023), "1023B");
        assert_eq!(bytes_to_formatted_string(1024), "1KiB");
        assert_eq!(bytes_to_formatted_string(BYTES_IN_MBYTE), "1MiB");
    }
}
