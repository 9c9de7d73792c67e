//! Hybrid logical clock (section 4.1). Fixed-width, lexicographically-sortable
//! strings: `TTTTTTTTTTTTT:CCCC:NNNNNNNN`. The generator never fails; if
//! the wall clock regresses the counter simply climbs, preserving
//! monotonicity at the cost of a (loggable) warning.

use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const DEVICE_ID_LEN: usize = 8;
const DEVICE_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Where the device id is persisted across restarts. Hosts wire this to
/// whatever durable, user-scoped storage they have (a preferences file, a
/// row in their own app database); the clock falls back to an
/// in-process-only random id when none is supplied.
pub trait DeviceIdStore: Send + Sync {
    fn get_device_id(&self) -> Option<String>;
    fn set_device_id(&self, id: &str);
}

/// A `DeviceIdStore` that never persists: a fresh random id every process
/// start. Used by tests and by hosts with no durable storage available.
#[derive(Default)]
pub struct EphemeralDeviceIdStore;

impl DeviceIdStore for EphemeralDeviceIdStore {
    fn get_device_id(&self) -> Option<String> {
        None
    }
    fn set_device_id(&self, _id: &str) {}
}

fn random_device_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..DEVICE_ID_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..DEVICE_ID_ALPHABET.len());
            DEVICE_ID_ALPHABET[idx] as char
        })
        .collect()
}

struct State {
    last_timestamp: u64,
    counter: u32,
}

/// Generates monotone HLC timestamps for one device/process.
pub struct Hlc {
    device_id: String,
    state: Mutex<State>,
}

impl Hlc {
    /// `store` is consulted once at construction to find (or persist) a
    /// stable device id; the clock itself doesn't re-read it afterward.
    pub fn new(store: &dyn DeviceIdStore) -> Self {
        let device_id = match store.get_device_id() {
            Some(id) => id,
            None => {
                let id = random_device_id();
                store.set_device_id(&id);
                id
            }
        };
        Self {
            device_id,
            state: Mutex::new(State {
                last_timestamp: 0,
                counter: 0,
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Generate a new, strictly-increasing-within-this-process HLC string.
    pub fn generate(&self) -> String {
        let now = wall_clock_ms();
        let mut state = self.state.lock();
        if now > state.last_timestamp {
            state.last_timestamp = now;
            state.counter = 0;
        } else {
            if now < state.last_timestamp {
                log::warn!(
                    "wall clock regressed ({} < {}); HLC counter will climb",
                    now,
                    state.last_timestamp
                );
            }
            state.counter += 1;
        }
        format!(
            "{:013}:{:04}:{}",
            state.last_timestamp, state.counter, self.device_id
        )
    }

    /// Identity function: an HLC string is already its own lexicographic
    /// ordering key.
    pub fn to_order_key(hlc: &str) -> String {
        hlc.to_string()
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHlc {
    pub timestamp_ms: u64,
    pub counter: u32,
    pub device_id_suffix: String,
}

/// Parse `TTTTTTTTTTTTT:CCCC:NNNNNNNN` into its components.
pub fn parse(s: &str) -> Option<ParsedHlc> {
    let mut parts = s.splitn(3, ':');
    let ts = parts.next()?.parse().ok()?;
    let counter = parts.next()?.parse().ok()?;
    let device_id_suffix = parts.next()?.to_string();
    Some(ParsedHlc {
        timestamp_ms: ts,
        counter,
        device_id_suffix,
    })
}

/// Lexicographic order over fixed-width HLC strings matches logical order,
/// so this is just `str::cmp` spelled out for call sites that want
/// `-1/0/1` instead of an `Ordering`.
pub fn compare(a: &str, b: &str) -> i32 {
    match a.cmp(b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotone_within_process() {
        let hlc = Hlc::new(&EphemeralDeviceIdStore);
        let mut prev = hlc.generate();
        for _ in 0..200 {
            let next = hlc.generate();
            assert_eq!(compare(&prev, &next), -1, "{prev} should be < {next}");
            prev = next;
        }
    }

    #[test]
    fn test_device_id_is_stable() {
        let hlc = Hlc::new(&EphemeralDeviceIdStore);
        let a = hlc.generate();
        let b = hlc.generate();
        assert_eq!(parse(&a).unwrap().device_id_suffix, hlc.device_id());
        assert_eq!(
            parse(&a).unwrap().device_id_suffix,
            parse(&b).unwrap().device_id_suffix
        );
    }

    #[test]
    fn test_format_width() {
        let hlc = Hlc::new(&EphemeralDeviceIdStore);
        let s = hlc.generate();
        let fields: Vec<&str> = s.split(':').collect();
        assert_eq!(fields[0].len(), 13);
        assert_eq!(fields[1].len(), 4);
        assert_eq!(fields[2].len(), DEVICE_ID_LEN);
    }

    #[derive(Default)]
    struct FixedIdStore(Mutex<Option<String>>);
    impl DeviceIdStore for FixedIdStore {
        fn get_device_id(&self) -> Option<String> {
            self.0.lock().clone()
        }
        fn set_device_id(&self, id: &str) {
            *self.0.lock() = Some(id.to_string());
        }
    }

    #[test]
    fn test_persists_through_store() {
        let store = FixedIdStore::default();
        let hlc1 = Hlc::new(&store);
        let id1 = hlc1.device_id().to_string();
        let hlc2 = Hlc::new(&store);
        assert_eq!(id1, hlc2.device_id());
    }

    #[test]
    fn test_compare_lexicographic() {
        assert_eq!(
            compare(
                "0000000000001:0000:devA0000",
                "0000000000001:0001:devA0000"
            ),
            -1
        );
        assert_eq!(
            compare(
                "0000000000002:0000:devA0000",
                "0000000000001:9999:devA0000"
            ),
            1
        );
    }
}
