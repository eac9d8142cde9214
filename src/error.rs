// Copyright 2024 Cloudflare, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The struct to represent errors of the pool.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;
use std::result::Result as StdResult;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = StdResult<T, E>;

/// The struct that represents an error
#[derive(Debug)]
pub struct Error {
    /// the type of error
    pub etype: ErrorType,
    /// an arbitrary string that explains the context when the error happens
    pub context: Option<Cow<'static, str>>,
    /// chain to the cause of this error
    pub cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
}

/// Predefined types of errors
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    /// The pool is closed. Returned to every call made after [close](crate::Pool::close)
    /// and to waiters drained by it.
    PoolClosed,
    /// The waiter queue is full. Carries the queue length observed by the rejected acquire.
    TooBusy(usize),
    /// The connector failed to establish a connection for the waiter.
    ConnectFailed,
    /// A lease was recycled twice. A programming error of the caller, the pool is unaffected.
    AlreadyRecycled,
}

impl ErrorType {
    /// for displaying the error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::PoolClosed => "PoolClosed",
            ErrorType::TooBusy(_) => "TooBusy",
            ErrorType::ConnectFailed => "ConnectFailed",
            ErrorType::AlreadyRecycled => "AlreadyRecycled",
        }
    }
}

impl Error {
    /// Simply create the error. See other functions that provide less verbose interfaces.
    #[inline]
    pub fn create(
        etype: ErrorType,
        context: Option<Cow<'static, str>>,
        cause: Option<Box<dyn ErrorTrait + Send + Sync>>,
    ) -> BError {
        Box::new(Error {
            etype,
            context,
            cause,
        })
    }

    /// Create an error with the given type
    #[inline]
    pub fn new(e: ErrorType) -> BError {
        Self::create(e, None, None)
    }

    /// Short for `Err(Self::new)`
    #[inline]
    pub fn err<T>(e: ErrorType) -> Result<T> {
        Err(Self::new(e))
    }

    /// Create an error with context but no direct causing error
    #[inline]
    pub fn explain<S: Into<Cow<'static, str>>>(e: ErrorType, context: S) -> BError {
        Self::create(e, Some(context.into()), None)
    }

    /// Short for `Err(Self::explain)`
    #[inline]
    pub fn e_explain<T, S: Into<Cow<'static, str>>>(e: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(e, context))
    }

    /// Create an error with the given type, a context string and the causing error.
    /// Only use it when there is extra context not captured by the causing error itself.
    #[inline]
    pub fn because<S, E>(e: ErrorType, context: S, cause: E) -> BError
    where
        S: Into<Cow<'static, str>>,
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        Self::create(e, Some(context.into()), Some(cause.into()))
    }

    /// Short for `Err(Self::because)`
    #[inline]
    pub fn e_because<T, S, E>(e: ErrorType, context: S, cause: E) -> Result<T>
    where
        S: Into<Cow<'static, str>>,
        E: Into<Box<dyn ErrorTrait + Send + Sync>>,
    {
        Err(Self::because(e, context, cause))
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn reason_str(&self) -> &str {
        self.etype.as_str()
    }

    // Display the error but skip elements duplicated from the previous hop
    fn chain_display(&self, previous: Option<&Error>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if previous.map(|p| p.etype != self.etype).unwrap_or(true) {
            write!(f, "{}", self.etype.as_str())?;
        }
        if let Some(c) = self.context.as_ref() {
            write!(f, " context: {}", c)?;
        }
        if let Some(c) = self.cause.as_ref() {
            if let Some(e) = c.downcast_ref::<BError>() {
                write!(f, " cause: ")?;
                e.chain_display(Some(self), f)
            } else {
                write!(f, " cause: {}", c)
            }
        } else {
            Ok(())
        }
    }

    /// Return the ErrorType of the root Error
    pub fn root_etype(&self) -> &ErrorType {
        self.cause.as_ref().map_or(&self.etype, |c| {
            // Stop the recursion if the cause is not Error
            c.downcast_ref::<BError>()
                .map_or(&self.etype, |e| e.root_etype())
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain_display(None, f)
    }
}

impl ErrorTrait for Error {}
