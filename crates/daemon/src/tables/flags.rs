//! Typed bitsets stored in the status tables.

macro_rules! bitset {
    ($(#[$meta:meta])* $name:ident($repr:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name($repr);

        impl $name {
            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0 && other.0 != 0
            }

            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: Self, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitset!(
    /// `host_status` of an FSA entry.
    HostStatus(u32)
);

impl HostStatus {
    pub const PAUSE_QUEUE: Self = Self(1 << 0);
    pub const AUTO_PAUSE_QUEUE: Self = Self(1 << 1);
    pub const STOP_TRANSFER: Self = Self(1 << 2);
    pub const HOST_DISABLED: Self = Self(1 << 3);
    pub const ERROR_ACKNOWLEDGED: Self = Self(1 << 4);
    pub const ERROR_OFFLINE: Self = Self(1 << 5);
    /// Offline only inside the event-handle window.
    pub const ERROR_OFFLINE_T: Self = Self(1 << 6);
    pub const ERROR_OFFLINE_STATIC: Self = Self(1 << 7);
    pub const WARN_TIME_REACHED: Self = Self(1 << 8);
    pub const SIMULATE_SEND: Self = Self(1 << 9);

    pub fn is_disabled(self) -> bool {
        self.contains(Self::HOST_DISABLED)
    }

    pub fn is_queue_paused(self) -> bool {
        self.intersects(Self::PAUSE_QUEUE | Self::AUTO_PAUSE_QUEUE)
    }
}

bitset!(
    /// Protocols a host or directory is configured for.
    ProtocolSet(u32)
);

impl ProtocolSet {
    pub const FTP: Self = Self(1 << 0);
    pub const LOC: Self = Self(1 << 1);
    pub const SMTP: Self = Self(1 << 2);
    pub const SFTP: Self = Self(1 << 3);
    pub const HTTP: Self = Self(1 << 4);
    pub const EXEC: Self = Self(1 << 5);
    pub const WMO: Self = Self(1 << 6);

    /// Map a URL scheme to its protocol bit.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "ftp" | "ftps" => Some(Self::FTP),
            "file" | "loc" => Some(Self::LOC),
            "mailto" | "smtp" => Some(Self::SMTP),
            "sftp" | "scp" => Some(Self::SFTP),
            "http" | "https" => Some(Self::HTTP),
            "exec" => Some(Self::EXEC),
            "wmo" => Some(Self::WMO),
            _ => None,
        }
    }

    pub fn is_local(self) -> bool {
        self == Self::LOC || self == Self::empty()
    }
}

bitset!(
    /// `protocol_options` of an FSA entry.
    ProtocolOptions(u32)
);

impl ProtocolOptions {
    pub const FTP_PASSIVE_MODE: Self = Self(1 << 0);
    pub const FTP_EXTENDED_MODE: Self = Self(1 << 1);
    pub const USE_SSL: Self = Self(1 << 2);
    pub const KEEP_CONNECTED: Self = Self(1 << 3);
}

bitset!(
    /// `dir_options` of an FRA entry.
    DirOptions(u32)
);

impl DirOptions {
    pub const INOTIFY_RENAME: Self = Self(1 << 0);
    pub const INOTIFY_CLOSE: Self = Self(1 << 1);
    pub const INOTIFY_CREATE: Self = Self(1 << 2);
    pub const INOTIFY_DELETE: Self = Self(1 << 3);
    pub const INOTIFY_ATTRIB: Self = Self(1 << 4);
    pub const FORCE_REREAD: Self = Self(1 << 5);
    pub const REMOTE_ONLY: Self = Self(1 << 6);
    pub const CREATE_SOURCE_DIR: Self = Self(1 << 7);
    pub const ACCEPT_DOT_FILES: Self = Self(1 << 8);

    pub const INOTIFY_ANY: Self = Self(0x1f);

    pub fn wants_inotify(self) -> bool {
        self.intersects(Self::INOTIFY_ANY)
    }

    pub fn is_force_reread(self) -> bool {
        self.contains(Self::FORCE_REREAD)
    }

    pub fn is_remote_only(self) -> bool {
        self.contains(Self::REMOTE_ONLY)
    }

    pub fn creates_source_dir(self) -> bool {
        self.contains(Self::CREATE_SOURCE_DIR)
    }

    pub fn accepts_dot_files(self) -> bool {
        self.contains(Self::ACCEPT_DOT_FILES)
    }
}

bitset!(
    /// `dir_flag` of an FRA entry; written only by dir_check.
    DirFlag(u32)
);

impl DirFlag {
    pub const MAX_COPIED: Self = Self(1 << 0);
    pub const FILES_IN_QUEUE: Self = Self(1 << 1);
    pub const DIR_DISABLED: Self = Self(1 << 2);
    pub const DIR_ERROR_SET: Self = Self(1 << 3);
    pub const WARN_TIME_REACHED: Self = Self(1 << 4);
    pub const INOTIFY_NEEDS_SCAN: Self = Self(1 << 5);

    pub fn is_disabled(self) -> bool {
        self.contains(Self::DIR_DISABLED)
    }

    pub fn needs_scan(self) -> bool {
        self.contains(Self::INOTIFY_NEEDS_SCAN)
    }

    pub fn is_warn_time_reached(self) -> bool {
        self.contains(Self::WARN_TIME_REACHED)
    }
}

/// Feature-flag byte of the FSA header.
pub mod fsa_feature {
    pub const DISABLE_RETRIEVE: u8 = 1 << 0;
    pub const DISABLE_ARCHIVE: u8 = 1 << 1;
    pub const DISABLE_HOST_WARN_TIME: u8 = 1 << 2;
}

/// Feature-flag byte of the FRA header.
pub mod fra_feature {
    pub const DISABLE_DIR_WARN_TIME: u8 = 1 << 0;
}
