//! Internal error handling macros.
//!
//! Recoverable failures travel as [`Result`]s through the per-subsystem
//! error enums; [`fatal!`] is reserved for unrecoverable runtime bugs
//! (invariant violations) and construction-time failures the process
//! cannot continue past.

/// Displays a system error message and aborts the program.
///
/// Use this for unrecoverable errors that indicate bugs in the reactor
/// implementation itself. The program prints a diagnostic message and
/// immediately aborts without unwinding.
///
/// # Examples
///
/// ```ignore
/// if by_time.len() != by_id.len() {
///   fatal!("timer wheel indices out of sync");
/// }
/// ```
macro_rules! fatal {
  ($($error:tt)*) => {{
    ::std::eprintln!(
      "{}:{}: (SysInv) a system invariant has been broken: {}",
      ::std::file!(),
      ::std::line!(),
      ::std::format_args!($($error)*),
    );

    ::std::process::abort();
  }};
}

pub(crate) use fatal;
