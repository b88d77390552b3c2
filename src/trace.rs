//! Opt-in allocation tracing: fixed-width, `char`-prefixed records
//! written straight to a file descriptor with `write(2)`.
//!
//! The fd number comes from `SIDEMALLOC_TRACE_FD` the first time a
//! record is emitted.  Record writers never allocate: one stack
//! buffer, one syscall.
use std::ffi::c_void;

const HEX: &[u8; 16] = b"0123456789ABCDEF";

/// ` 0x` + 16 hex digits.
const FIELD_WIDTH: usize = 19;

fn trace_fd() -> Option<i32> {
    lazy_static::lazy_static! {
        static ref FD: Option<i32> = std::env::var("SIDEMALLOC_TRACE_FD")
            .ok()
            .and_then(|value| value.parse().ok());
    }

    *FD
}

/// Right-aligns `val` in hex into a 16-byte window of `'0'`s.
fn store_hex(window: &mut [u8], mut val: usize) {
    let mut pos = 15;

    while val > 0 {
        window[pos] = HEX[val & 0xF];
        val >>= 4;
        if pos == 0 {
            break;
        }
        pos -= 1;
    }
}

fn write_record(func: u8, fields: &[usize]) {
    let fd = match trace_fd() {
        Some(fd) => fd,
        None => return,
    };

    debug_assert!(fields.len() <= 4);
    let mut buffer = [b'0'; 1 + 4 * FIELD_WIDTH + 1];

    buffer[0] = func;
    for (i, field) in fields.iter().enumerate() {
        let offset = 1 + i * FIELD_WIDTH;
        buffer[offset] = b' ';
        buffer[offset + 1] = b'0';
        buffer[offset + 2] = b'x';
        store_hex(&mut buffer[offset + 3..offset + FIELD_WIDTH], *field);
    }

    let len = 1 + fields.len() * FIELD_WIDTH;
    buffer[len] = b'\n';

    // Best effort; a trace fd that goes away must not take the
    // allocator down with it.
    unsafe { libc::write(fd, buffer.as_ptr() as *const c_void, len + 1) };
}

pub(crate) fn trace_malloc(size: usize, ptr: usize) {
    write_record(b'm', &[size, ptr, 0]);
}

pub(crate) fn trace_free(ptr: usize) {
    write_record(b'f', &[ptr, 0]);
}

pub(crate) fn trace_calloc(nmemb: usize, size: usize, ptr: usize) {
    write_record(b'c', &[nmemb, size, ptr, 0]);
}

pub(crate) fn trace_realloc(old_ptr: usize, size: usize, new_ptr: usize) {
    write_record(b'r', &[old_ptr, size, new_ptr, 0]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_right_aligned() {
        let mut window = [b'0'; 16];

        store_hex(&mut window, 0xDEAD);
        assert_eq!(&window, b"000000000000DEAD");

        let mut window = [b'0'; 16];
        store_hex(&mut window, usize::MAX);
        assert_eq!(&window, b"FFFFFFFFFFFFFFFF");

        let mut window = [b'0'; 16];
        store_hex(&mut window, 0);
        assert_eq!(&window, b"0000000000000000");
    }

    #[test]
    fn record_lengths_match_the_original_format() {
        // 'm' carries 3 fields, 'f' 2, 'c' and 'r' 4; plus prefix
        // and newline that is 59, 40, and 78 bytes on the wire.
        assert_eq!(1 + 3 * FIELD_WIDTH + 1, 59);
        assert_eq!(1 + 2 * FIELD_WIDTH + 1, 40);
        assert_eq!(1 + 4 * FIELD_WIDTH + 1, 78);
    }

    #[test]
    fn tracing_without_fd_is_a_no_op() {
        // The env var is unset in tests: every writer must return
        // quietly.
        trace_malloc(100, 0x1000);
        trace_free(0x1000);
        trace_calloc(10, 10, 0x2000);
        trace_realloc(0x2000, 300, 0x3000);
    }
}
