/// Signal numbers defined by the GDB Remote Serial Protocol.
///
/// Only the signals this server actually reports are named; the full table
/// lives in `include/gdb/signals.def` in the GDB source tree.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(pub u8);

#[rustfmt::skip]
impl Signal {
    #[doc = "Interrupt"]             pub const SIGINT:  Self = Self(2);
    #[doc = "Illegal instruction"]   pub const SIGILL:  Self = Self(4);
    #[doc = "Trace/breakpoint trap"] pub const SIGTRAP: Self = Self(5);
    #[doc = "Aborted"]               pub const SIGABRT: Self = Self(6);
    #[doc = "Emulation trap"]        pub const SIGEMT:  Self = Self(7);
    #[doc = "Killed"]                pub const SIGKILL: Self = Self(9);
    #[doc = "Bus error"]             pub const SIGBUS:  Self = Self(10);
    #[doc = "Segmentation fault"]    pub const SIGSEGV: Self = Self(11);
    #[doc = "Bad system call"]       pub const SIGSYS:  Self = Self(12);
    #[doc = "Terminated"]            pub const SIGTERM: Self = Self(15);
    #[doc = "Stopped (signal)"]      pub const SIGSTOP: Self = Self(17);
}

impl core::fmt::Display for Signal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match *self {
            Signal::SIGINT => "SIGINT",
            Signal::SIGILL => "SIGILL",
            Signal::SIGTRAP => "SIGTRAP",
            Signal::SIGABRT => "SIGABRT",
            Signal::SIGEMT => "SIGEMT",
            Signal::SIGKILL => "SIGKILL",
            Signal::SIGBUS => "SIGBUS",
            Signal::SIGSEGV => "SIGSEGV",
            Signal::SIGSYS => "SIGSYS",
            Signal::SIGTERM => "SIGTERM",
            Signal::SIGSTOP => "SIGSTOP",
            _ => return write!(f, "signal {}", self.0),
        };
        write!(f, "{}", name)
    }
}
