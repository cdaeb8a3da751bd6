//! Perform one raw syscall and exit with the low byte of its outcome.
//!
//! ```sh
//! evofuzz-executor <number> [arg]...
//! ```
//!
//! Arguments are decimal 64-bit values passed to the syscall unchanged. The exit code is the
//! result on success or the errno on failure, truncated to eight bits. The process may also
//! never exit, or die to a signal, which is the point.

use clap::{value_parser, Arg, Command};
use libc::c_long;

/// Registers available to a syscall.
const SLOTS: usize = 6;

fn command() -> Command {
    Command::new("evofuzz-executor")
        .about("Perform one raw syscall.")
        .arg(
            Arg::new("number")
                .required(true)
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("args")
                .num_args(0..=SLOTS)
                .value_parser(value_parser!(u64)),
        )
}

/// Map a syscall result to an exit code.
fn exit_code(result: c_long, errno: i32) -> i32 {
    let outcome = if result == -1 { errno as c_long } else { result };
    (outcome & 0xff) as i32
}

fn main() {
    let matches = command().get_matches();
    let number = matches.get_one::<u64>("number").copied().unwrap_or_default();
    let mut args = [0u64; SLOTS];
    if let Some(values) = matches.get_many::<u64>("args") {
        for (slot, value) in args.iter_mut().zip(values) {
            *slot = *value;
        }
    }

    // SAFETY: executing arbitrary syscalls is the purpose of this process; it owns no state
    // worth protecting.
    let result = unsafe {
        libc::syscall(
            number as c_long,
            args[0] as c_long,
            args[1] as c_long,
            args[2] as c_long,
            args[3] as c_long,
            args[4] as c_long,
            args[5] as c_long,
        )
    };
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or_default();
    std::process::exit(exit_code(result, errno));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(exit_code(0, 0), 0);
        assert_eq!(exit_code(4096, 0), 0);
        assert_eq!(exit_code(259, 0), 3);
        assert_eq!(exit_code(-1, libc::EBADF), libc::EBADF);
    }

    #[test]
    fn test_arguments() {
        let matches = command()
            .try_get_matches_from(["evofuzz-executor", "3", "18446744073709551615"])
            .unwrap();
        assert_eq!(matches.get_one::<u64>("number"), Some(&3));
        assert_eq!(
            matches.get_many::<u64>("args").unwrap().copied().collect::<Vec<_>>(),
            vec![u64::MAX]
        );

        assert!(command().try_get_matches_from(["evofuzz-executor"]).is_err());
        assert!(command()
            .try_get_matches_from(["evofuzz-executor", "1", "1", "2", "3", "4", "5", "6", "7"])
            .is_err());
    }
}
