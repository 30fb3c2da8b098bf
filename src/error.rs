//! Error types returned by the timer.

use failure::{Backtrace, Context, Fail};

use std::fmt::{self, Debug, Display};

/// An error with a kind and, optionally, content handed back to the caller.
///
/// An `Error` contains an [`ErrorKind`] which gives context on the error
/// cause, as well as an `Option<T>` which is used to prevent the loss of
/// data in case of a failed call. For instance, a rejected [`schedule`]
/// hands the caller's task back through the error's content instead of
/// dropping it.
///
/// # Usage example
/// ```
/// use hashed_wheel_timer::{ErrorKind, Timer};
/// use std::time::Duration;
///
/// let timer = Timer::builder().max_pending_timeouts(1).build().unwrap();
/// timer.schedule(Box::new(|_| {}), Duration::from_secs(60)).unwrap();
///
/// match timer.schedule(Box::new(|_| {}), Duration::from_secs(60)) {
///     Err(mut err) => {
///         assert_eq!(err.kind(), ErrorKind::Rejected);
///         let _task = err.take_content().unwrap();
///     }
///     Ok(_) => panic!("expected rejection"),
/// }
/// ```
///
/// [`schedule`]: struct.Timer.html#method.schedule
pub struct Error<T>
where
    T: 'static + Send,
{
    inner: Context<ErrorKind>,
    content: Option<T>,
}

impl<T> Error<T>
where
    T: 'static + Send,
{
    /// Create a new error using the given `ErrorKind` with no content.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
            content: None,
        }
    }

    /// Create a new error using the given `ErrorKind` and content.
    pub fn with_content(kind: ErrorKind, content: T) -> Self {
        Self {
            inner: Context::new(kind),
            content: Some(content),
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        *self.inner.get_context()
    }

    /// Returns a reference to the content held by the error, if any.
    pub fn content(&self) -> Option<&T> {
        self.content.as_ref()
    }

    /// Takes the content held by the error, if any.
    pub fn take_content(&mut self) -> Option<T> {
        self.content.take()
    }

    /// Discards the content, keeping only the `ErrorKind`.
    pub(crate) fn without_content<U>(self) -> Error<U>
    where
        U: 'static + Send,
    {
        Error {
            inner: self.inner,
            content: None,
        }
    }
}

impl<T> Fail for Error<T>
where
    T: 'static + Send,
{
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl<T> Display for Error<T>
where
    T: 'static + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl<T> From<ErrorKind> for Error<T>
where
    T: 'static + Send,
{
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

// Hand-written rather than `#[derive(Debug)]`: a derive would add a
// `T: Debug` bound, but `T` is `Task = Box<dyn FnOnce(...) + Send>` at one
// of this type's instantiation sites, and no boxed `FnOnce` trait object
// implements `Debug`. The content itself isn't inspectable generically, so
// only the `ErrorKind` context is printed.
impl<T> Debug for Error<T>
where
    T: 'static + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind())
            .field("content", &self.content.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Used to give context to an [`Error`].
///
/// # Note
/// This error type is non-exhaustive and could have additional variants
/// added in the future. When matching against variants, add an extra
/// wildcard arm to account for any future variants.
///
/// [`Error`]: struct.Error.html
#[derive(Debug, Copy, Clone, PartialEq, Eq, Fail, Hash)]
pub enum ErrorKind {
    /// A constructor argument did not satisfy its contract (non-positive
    /// duration, an oversized wheel, a tick that doesn't fit in a 32-bit
    /// millisecond sleep, etc).
    #[fail(display = "invalid input: {}", msg)]
    InvalidInput {
        /// Additional information on the error.
        msg: &'static str,
    },
    /// `start()` was called after `stop()`, or `stop()` was called from the
    /// worker thread itself.
    #[fail(display = "illegal state: {}", msg)]
    IllegalState {
        /// Additional information on the error.
        msg: &'static str,
    },
    /// `schedule()` was rejected because the configured pending-timeout
    /// limit was reached.
    #[fail(display = "rejected: pending timeout limit reached")]
    Rejected,
    /// The worker observed a record in a bucket whose deadline doesn't
    /// match the bucket being expired. This indicates a logic bug in the
    /// wheel itself and should be unreachable.
    #[fail(display = "internal consistency violation: {}", msg)]
    InternalConsistency {
        /// Additional information on the error.
        msg: &'static str,
    },
}
