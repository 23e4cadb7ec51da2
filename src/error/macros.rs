//! Internal error handling macros.

/// Displays a system error message and aborts the program.
///
/// Use this for failures after which the emulation layer cannot keep its
/// global state consistent: a host thread that cannot be created, an
/// ephemeral lock used after its event was closed, a corrupted recovery
/// stack. The program prints a diagnostic message and immediately aborts
/// without unwinding.
///
/// # Examples
///
/// ```ignore
/// if thread.is_err() {
///   fatal!("cannot create worker thread");
/// }
/// ```
macro_rules! fatal {
  ($error:expr) => {{
    let error = &$error;

    ::tracing::error!(target: "posix_shim", error = %error, "fatal");

    ::std::eprintln!(
      "{}:{}: (SysInv) a system invariant has been broken: {}",
      ::std::file!(),
      ::std::line!(),
      error,
    );

    ::std::process::abort();
  }};
}

pub(crate) use fatal;
