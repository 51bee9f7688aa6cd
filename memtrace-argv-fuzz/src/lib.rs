//! `LD_PRELOAD` companion that lets a file-fuzzer mutate selected `argv` entries of the
//! process under test. Not part of the four core subsystems; it only shares their
//! environment-variable contract.
//!
//! Ported from `original_source/lib/argvfuzz.c` and `argv-fuzz-inl.h` (itself AFL++'s
//! `argv-fuzz-inl.h` preload wrapper). The original hooks `__libc_start_main` directly via
//! `dlsym(RTLD_NEXT, ...)` and rewrites `argc`/`argv` before handing control to the real libc
//! entry point; that is preserved here since argv can only be rewritten before `main` is
//! called. [`ctor`] is used the way `samply-mac-preload` uses its `__mod_init_func` trick
//! (`examples/mstange-samply/samply-mac-preload/src/lib.rs`): to do as much of the
//! environment/file-descriptor setup as possible ahead of time, in a safe constructor context,
//! before the narrow unsafe `__libc_start_main` override runs.

use libc::{c_char, c_int, c_void};
use once_cell::sync::OnceCell;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;

const MAX_CMDLINE_LEN: usize = 100_000;
const MAX_CMDLINE_PAR: usize = 50_000;

/// Parsed once at load time from the environment; `None` means the preload is inert (no
/// input-file argv rewriting requested).
struct FuzzConfig {
    /// argv indices to be overwritten with `fuzz_instance_name`.
    replace_indices: Vec<usize>,
    /// Path the residual (post-argv) portion of the input file is written to, and the value
    /// substituted into each of `replace_indices`.
    fuzz_instance_name: CString,
    /// Optional replacement for fd 0.
    stdin_file: Option<CString>,
}

static CONFIG: OnceCell<Option<FuzzConfig>> = OnceCell::new();

/// `INPUT_FILE_ARGV_INDICES` is a punctuation-separated list of decimal indices
/// (`original_source/lib/argvfuzz.c`'s `sscanf(ptr, "%lu", ...)` loop, which advances past
/// runs of non-digit characters between numbers).
fn parse_indices(raw: &str) -> Vec<usize> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<usize>().ok())
        .collect()
}

fn load_config() -> Option<FuzzConfig> {
    let indices_env = std::env::var("INPUT_FILE_ARGV_INDICES").ok()?;
    let fuzz_instance_name = std::env::var("FUZZ_INSTANCE_NAME")
        .ok()
        .and_then(|s| CString::new(s).ok())?;
    let replace_indices = parse_indices(&indices_env);
    let stdin_file = std::env::var("STDIN_FILE")
        .ok()
        .and_then(|s| CString::new(s).ok());
    Some(FuzzConfig {
        replace_indices,
        fuzz_instance_name,
        stdin_file,
    })
}

#[ctor::ctor]
fn init() {
    let _ = CONFIG.set(load_config());
}

/// Splits a NUL-delimited argv blob the way `afl_init_argv` does: empty params are encoded as
/// a lone `0x02`, two consecutive NULs terminate the array.
fn split_argv_blob(buf: &[u8]) -> Vec<CString> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        let start = i;
        while i < buf.len() && buf[i] != 0 {
            i += 1;
        }
        if i == start && i < buf.len() {
            // Two NULs back to back: end of the array.
            break;
        }
        let mut field = buf[start..i].to_vec();
        if field.len() == 1 && field[0] == 0x02 {
            field.clear();
        }
        out.push(CString::new(field).unwrap_or_default());
        i += 1; // skip the NUL
        if i >= buf.len() {
            break;
        }
    }
    out
}

/// Reads the replacement-argument blob from `fd`, returning the sub-argv it encodes and
/// writing everything past the blob to `fuzz_instance_name` (the part of the input file the
/// instrumented program should still see as its own input), mirroring `afl_init_argv`.
fn read_argv_blob(fd: c_int, fuzz_instance_name: &CString) -> Vec<CString> {
    let mut buf = vec![0u8; MAX_CMDLINE_LEN];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n <= 0 {
        return Vec::new();
    }
    let n = n as usize;
    buf.truncate(n);

    // Find the end of the NUL-delimited argv section: the first double-NUL, or EOF.
    let mut end = 0;
    let mut nul_run = 0;
    while end < buf.len() {
        if buf[end] == 0 {
            nul_run += 1;
            if nul_run == 2 {
                break;
            }
        } else {
            nul_run = 0;
        }
        end += 1;
    }
    let argv_section = &buf[..end.min(buf.len())];
    let mut sub_argv = split_argv_blob(argv_section);
    sub_argv.truncate(MAX_CMDLINE_PAR);

    let residual_start = (end + 1).min(buf.len());
    if fd == 0 {
        unsafe {
            libc::lseek(fd, residual_start as libc::off_t, libc::SEEK_SET);
        }
    } else if let Ok(mut out) = File::create(fuzz_instance_name.to_string_lossy().as_ref()) {
        use std::io::Write;
        let _ = out.write_all(&buf[residual_start..]);
        let mut tail = Vec::new();
        let mut f = unsafe {
            use std::os::unix::io::FromRawFd;
            File::from_raw_fd(libc::dup(fd))
        };
        if f.read_to_end(&mut tail).is_ok() {
            let _ = out.write_all(&tail);
        }
        unsafe {
            libc::close(fd);
        }
    }
    sub_argv
}

type LibcStartMain = unsafe extern "C" fn(
    main: extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int,
    argc: c_int,
    argv: *mut *mut c_char,
    init: extern "C" fn(),
    fini: extern "C" fn(),
    rtld_fini: extern "C" fn(),
    stack_end: *mut c_void,
) -> c_int;

/// Overrides glibc's real entry trampoline the way `original_source/lib/argvfuzz.c` does:
/// `dlsym(RTLD_NEXT, "__libc_start_main")` finds the genuine implementation, argv is rewritten
/// in place, then control is handed off as if nothing happened.
#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int,
    argc: c_int,
    argv: *mut *mut c_char,
    init: extern "C" fn(),
    fini: extern "C" fn(),
    rtld_fini: extern "C" fn(),
    stack_end: *mut c_void,
) -> c_int {
    let orig_name = CString::new("__libc_start_main").unwrap();
    let orig_ptr = libc::dlsym(libc::RTLD_NEXT, orig_name.as_ptr());
    if orig_ptr.is_null() {
        eprintln!("memtrace-argv-fuzz: could not find original __libc_start_main");
        libc::exit(libc::EXIT_FAILURE);
    }
    let orig: LibcStartMain = std::mem::transmute(orig_ptr);

    let config = CONFIG.get().and_then(|c| c.as_ref());
    let Some(config) = config else {
        return orig(main, argc, argv, init, fini, rtld_fini, stack_end);
    };

    let original_argv0 = if argc > 0 && !argv.is_null() {
        Some(std::ffi::CStr::from_ptr(*argv).to_owned())
    } else {
        None
    };

    let input_path = if config.replace_indices.is_empty() || argv.is_null() {
        None
    } else {
        config
            .replace_indices
            .first()
            .and_then(|&idx| {
                if (idx as c_int) < argc {
                    Some(*argv.add(idx))
                } else {
                    None
                }
            })
    };

    let fd = match input_path {
        Some(path_ptr) => {
            let fd = libc::open(path_ptr, libc::O_RDONLY);
            if fd == -1 {
                let path = std::ffi::CStr::from_ptr(path_ptr).to_string_lossy();
                eprintln!("memtrace-argv-fuzz: cannot open {path}");
                libc::exit(libc::EXIT_FAILURE);
            }
            fd
        }
        None => 0,
    };

    let mut sub_argv = read_argv_blob(fd, &config.fuzz_instance_name);
    if sub_argv.is_empty() {
        sub_argv.push(original_argv0.clone().unwrap_or_else(|| CString::new("a.out").unwrap()));
    }

    for &idx in &config.replace_indices {
        if idx < sub_argv.len() {
            sub_argv[idx] = config.fuzz_instance_name.clone();
        }
    }
    if let Some(argv0) = original_argv0 {
        sub_argv[0] = argv0;
    }

    if !config.replace_indices.is_empty() {
        if let Some(stdin_file) = &config.stdin_file {
            let stdin_fd = libc::open(stdin_file.as_ptr(), libc::O_RDONLY);
            if stdin_fd >= 0 {
                libc::dup2(stdin_fd, 0);
                libc::close(stdin_fd);
            }
        }
    }

    let mut c_argv: Vec<*mut c_char> = sub_argv.iter().map(|s| s.as_ptr() as *mut c_char).collect();
    c_argv.push(std::ptr::null_mut());

    orig(
        main,
        c_argv.len() as c_int - 1,
        c_argv.as_mut_ptr(),
        init,
        fini,
        rtld_fini,
        stack_end,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_punctuation_separated_indices() {
        assert_eq!(parse_indices("1,3;5 7"), vec![1, 3, 5, 7]);
    }

    #[test]
    fn single_index_parses() {
        assert_eq!(parse_indices("2"), vec![2]);
    }

    #[test]
    fn split_argv_blob_decodes_empty_param_marker() {
        let blob = b"prog\0\x02\0foo\0";
        let parts = split_argv_blob(blob);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].to_str().unwrap(), "prog");
        assert_eq!(parts[1].to_str().unwrap(), "");
        assert_eq!(parts[2].to_str().unwrap(), "foo");
    }

    #[test]
    fn split_argv_blob_stops_at_double_nul() {
        let blob = b"a\0b\0\0leftover-data";
        let parts = split_argv_blob(blob);
        assert_eq!(parts.len(), 2);
    }
}
