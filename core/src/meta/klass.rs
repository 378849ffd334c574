use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::heap::INSTANCE_BASE_OFFSET;
use crate::value::{BasicType, KlassId, MethodId, ObjRef, TosState};

/// Resolved layout of one declared field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: Arc<str>,
    pub tos: TosState,
    /// Word offset within the instance (or within the mirror for statics).
    pub offset: u32,
    pub is_static: bool,
    pub is_volatile: bool,
    pub is_final: bool,
}

/// One interface's slice of a klass's itable.
#[derive(Debug, Clone)]
pub struct ItableBlock {
    pub interface: KlassId,
    /// Implementation per interface-method itable index; `None` means the
    /// receiver class provides no implementation (AbstractMethodError at
    /// dispatch).
    pub methods: Vec<Option<MethodId>>,
}

#[derive(Debug)]
pub struct InstanceShape {
    /// Object size in words, header included.
    pub size_words: usize,
    /// Static field words carried by the mirror.
    pub static_words: usize,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodId>,
    pub vtable: Vec<MethodId>,
    pub itable: Vec<ItableBlock>,
    pub has_finalizer: bool,
    pub is_interface: bool,
    /// `<clinit>` to run when initialization is triggered.
    pub clinit: Option<MethodId>,
}

#[derive(Debug)]
pub enum KlassKind {
    Instance(InstanceShape),
    TypeArray { elem: BasicType },
    ObjArray { elem_klass: KlassId },
}

/// Class initialization states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitState {
    Allocated = 0,
    Loaded = 1,
    Linked = 2,
    BeingInitialized = 3,
    FullyInitialized = 4,
    InitializationError = 5,
}

impl InitState {
    pub fn from_raw(raw: u8) -> InitState {
        match raw {
            0 => InitState::Allocated,
            1 => InitState::Loaded,
            2 => InitState::Linked,
            3 => InitState::BeingInitialized,
            4 => InitState::FullyInitialized,
            _ => InitState::InitializationError,
        }
    }
}

pub struct Klass {
    pub name: Arc<str>,
    pub id: KlassId,
    pub super_id: Option<KlassId>,
    /// Direct superinterfaces.
    pub interfaces: Vec<KlassId>,
    pub kind: KlassKind,
    init_state: AtomicU8,
    init_lock: Mutex<Option<u16>>,
    init_cv: Condvar,
    mirror: OnceCell<ObjRef>,
}

impl Klass {
    pub(crate) fn new(
        name: Arc<str>,
        id: KlassId,
        super_id: Option<KlassId>,
        interfaces: Vec<KlassId>,
        kind: KlassKind,
        init_state: InitState,
    ) -> Klass {
        Klass {
            name,
            id,
            super_id,
            interfaces,
            kind,
            init_state: AtomicU8::new(init_state as u8),
            init_lock: Mutex::new(None),
            init_cv: Condvar::new(),
            mirror: OnceCell::new(),
        }
    }

    #[inline]
    pub fn init_state(&self) -> InitState {
        InitState::from_raw(self.init_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.init_state() == InitState::FullyInitialized
    }

    /// Fast class-initialization check: fully initialized, or mid-`<clinit>`
    /// on the asking thread itself.
    pub fn is_init_ok_for(&self, thread: u16) -> bool {
        match self.init_state() {
            InitState::FullyInitialized => true,
            InitState::BeingInitialized => *self.init_lock.lock() == Some(thread),
            _ => false,
        }
    }

    /// Drive the initialization state machine. `run_clinit` is invoked at
    /// most once, outside the state lock, when this thread wins the claim.
    pub fn ensure_initialized<E>(
        &self,
        thread: u16,
        mut run_clinit: impl FnMut(MethodId) -> Result<(), E>,
    ) -> Result<(), InitFailure<E>> {
        loop {
            let mut owner = self.init_lock.lock();
            match self.init_state() {
                InitState::FullyInitialized => return Ok(()),
                InitState::InitializationError => return Err(InitFailure::ErrorState),
                InitState::BeingInitialized => {
                    if *owner == Some(thread) {
                        return Ok(());
                    }
                    self.init_cv.wait(&mut owner);
                }
                _ => {
                    *owner = Some(thread);
                    self.init_state
                        .store(InitState::BeingInitialized as u8, Ordering::Release);
                    drop(owner);

                    let clinit = match &self.kind {
                        KlassKind::Instance(shape) => shape.clinit,
                        _ => None,
                    };
                    let result = match clinit {
                        Some(mid) => run_clinit(mid),
                        None => Ok(()),
                    };

                    let mut owner = self.init_lock.lock();
                    *owner = None;
                    match result {
                        Ok(()) => {
                            self.init_state
                                .store(InitState::FullyInitialized as u8, Ordering::Release);
                            self.init_cv.notify_all();
                            return Ok(());
                        }
                        Err(e) => {
                            self.init_state
                                .store(InitState::InitializationError as u8, Ordering::Release);
                            self.init_cv.notify_all();
                            return Err(InitFailure::Clinit(e));
                        }
                    }
                }
            }
        }
    }

    /// Testing/bootstrap hook: force an initialization state.
    pub fn set_init_state(&self, state: InitState) {
        self.init_state.store(state as u8, Ordering::Release);
    }

    pub fn instance(&self) -> Option<&InstanceShape> {
        match &self.kind {
            KlassKind::Instance(shape) => Some(shape),
            _ => None,
        }
    }

    pub fn is_interface(&self) -> bool {
        self.instance().is_some_and(|s| s.is_interface)
    }

    pub fn has_finalizer(&self) -> bool {
        self.instance().is_some_and(|s| s.has_finalizer)
    }

    /// The instance fast path is allowed only for fully trivial layouts;
    /// finalizers force the slow path.
    pub fn is_fastpath_allocatable(&self) -> bool {
        self.instance().is_some_and(|s| !s.has_finalizer && !s.is_interface)
    }

    pub fn instance_size_words(&self) -> Option<usize> {
        self.instance().map(|s| s.size_words)
    }

    /// Both boolean and byte arrays are reached through the same store
    /// bytecode; this is the discriminating bit.
    pub fn is_boolean_array(&self) -> bool {
        matches!(self.kind, KlassKind::TypeArray { elem: BasicType::Boolean })
    }

    pub fn array_element(&self) -> Option<BasicType> {
        match &self.kind {
            KlassKind::TypeArray { elem } => Some(*elem),
            KlassKind::ObjArray { .. } => Some(BasicType::Object),
            KlassKind::Instance(_) => None,
        }
    }

    pub fn is_array(&self) -> bool {
        !matches!(self.kind, KlassKind::Instance(_))
    }

    pub(crate) fn mirror_cell(&self) -> &OnceCell<ObjRef> {
        &self.mirror
    }

    /// Words of the mirror object carrying this klass's statics.
    pub fn mirror_size_words(&self) -> usize {
        INSTANCE_BASE_OFFSET + self.instance().map_or(0, |s| s.static_words)
    }
}

/// Why `ensure_initialized` failed.
pub enum InitFailure<E> {
    /// A previous attempt already failed; the recorded error stands.
    ErrorState,
    /// This attempt's `<clinit>` failed.
    Clinit(E),
}

impl std::fmt::Debug for Klass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Klass")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("init_state", &self.init_state())
            .finish()
    }
}
