//! Runtime collaborators: thrown-exception values, the object synchronizer,
//! and the `VmEnv` bundle the interpreter calls out to.

mod env;
mod synchronizer;

pub use env::*;
pub use synchronizer::*;

use crate::value::ObjRef;

/// The recoverable-by-design bytecode faults, plus the linkage errors the
/// resolution runtime surfaces. These are Java-visible exceptions
/// (catchable by the embedder), never interpreter bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JavaExKind {
    NullPointerException,
    ArrayIndexOutOfBoundsException,
    ArithmeticException,
    ClassCastException,
    ArrayStoreException,
    NegativeArraySizeException,
    AbstractMethodError,
    IncompatibleClassChangeError,
    IllegalMonitorStateException,
    NoClassDefFoundError,
    NoSuchFieldError,
    NoSuchMethodError,
    InstantiationError,
    StackOverflowError,
    OutOfMemoryError,
    BootstrapMethodError,
    ExceptionInInitializerError,
    InternalError,
    /// An application object thrown by `athrow`.
    Thrown,
}

/// A thrown Java exception travelling up the interpreter as a value.
#[derive(Debug, Clone)]
pub struct JavaThrowable {
    pub kind: JavaExKind,
    pub message: Option<String>,
    /// The exception object, when one exists (`athrow`).
    pub object: Option<ObjRef>,
}

impl JavaThrowable {
    pub fn new(kind: JavaExKind, message: impl Into<String>) -> JavaThrowable {
        JavaThrowable {
            kind,
            message: Some(message.into()),
            object: None,
        }
    }

    pub fn bare(kind: JavaExKind) -> JavaThrowable {
        JavaThrowable {
            kind,
            message: None,
            object: None,
        }
    }

    pub fn thrown(object: ObjRef) -> JavaThrowable {
        JavaThrowable {
            kind: JavaExKind::Thrown,
            message: None,
            object: Some(object),
        }
    }
}

impl std::fmt::Display for JavaThrowable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{:?}: {}", self.kind, m),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

/// Non-local exit of a bytecode handler: either a Java exception unwinding
/// toward the embedder, or a fatal interpreter-contract violation.
#[derive(Debug)]
pub enum ExecSignal {
    Throw(JavaThrowable),
    Fatal(anyhow::Error),
}

impl From<JavaThrowable> for ExecSignal {
    fn from(t: JavaThrowable) -> ExecSignal {
        ExecSignal::Throw(t)
    }
}

impl From<anyhow::Error> for ExecSignal {
    fn from(e: anyhow::Error) -> ExecSignal {
        ExecSignal::Fatal(e)
    }
}

/// Handler-level result type used throughout the template table.
pub type BcResult<T> = Result<T, ExecSignal>;

/// What an invocation produced, as seen by the embedder.
#[derive(Debug)]
pub enum InvokeOutcome {
    Normal(Option<crate::value::JValue>),
    Threw(JavaThrowable),
}
