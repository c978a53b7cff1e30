use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::{
    AbiError, GuestArgs, GuestMemory, GuestRet, GuestThread, HleFn, HleFunction, KResult,
    KernelError,
};

/// One registered host function, keyed by its import nid.
#[derive(Debug, Clone)]
pub struct HleEntry {
    pub nid: u32,
    pub module: String,
    pub func: Arc<HleFunction>,
}

/// Registration failures, all surfaced during the init phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    Abi(AbiError),
    DuplicateNid { nid: u32 },
}

impl From<AbiError> for RegistryError {
    fn from(e: AbiError) -> Self {
        Self::Abi(e)
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abi(e) => write!(f, "unsupported signature: {e}"),
            Self::DuplicateNid { nid } => write!(f, "nid {nid:#010x} registered twice"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The import table: nid to wrapped host function. Filled during an explicit
/// init phase so every signature problem and nid collision is an error
/// before the first guest instruction runs.
pub struct FunctionRegistry {
    map: RwLock<HashMap<u32, HleEntry>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn register<F, A, R>(
        &self,
        module: &str,
        nid: u32,
        name: &str,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: HleFn<A, R>,
        A: GuestArgs,
        R: GuestRet,
    {
        let func = Arc::new(HleFunction::wrap(name, f)?);
        let mut map = self.map.write();
        if map.contains_key(&nid) {
            return Err(RegistryError::DuplicateNid { nid });
        }
        debug!("registered {module}::{name} at nid {nid:#010x}");
        map.insert(
            nid,
            HleEntry {
                nid,
                module: module.to_string(),
                func,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, nid: u32) -> Option<HleEntry> {
        self.map.read().get(&nid).cloned()
    }

    /// Marshals and runs the function registered under `nid` on the given
    /// thread. Unknown nids are reported, not fatal.
    pub fn dispatch(&self, nid: u32, thread: &mut GuestThread, mem: &GuestMemory) -> KResult<()> {
        let Some(entry) = self.lookup(nid) else {
            warn!("unimplemented import nid {nid:#010x}");
            return Err(KernelError::NotFound);
        };
        entry.func.call(thread, mem)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}
