use aws_sdk_dynamodb::error::BuildError;
use aws_sdk_dynamodb::operation::batch_get_item::BatchGetItemError;
use aws_sdk_dynamodb::operation::batch_write_item::BatchWriteItemError;
use aws_sdk_dynamodb::operation::put_item::PutItemError;
use aws_sdk_dynamodb::operation::scan::ScanError;
use aws_sdk_dynamodb::types::error::ConditionalCheckFailedException;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_runtime_api::http::Response;
use serde_dynamo::Error as SerdeDynamoError;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

type DynamoPutError = SdkError<PutItemError, Response>;
type DynamoScanError = SdkError<ScanError, Response>;
type DynamoBatchWriteItemError = SdkError<BatchWriteItemError, Response>;
type DynamoBatchGetItemError = SdkError<BatchGetItemError, Response>;

/// Batch, expression and table operation error
#[derive(Debug)]
pub enum Error {
    /// Item could not be encoded to or decoded from DynamoDB attributes
    SerdeDynamo(SerdeDynamoError),
    /// DynamoDB request builder error
    BuildError(BuildError),
    /// DynamoDB PutItem operation error
    DynamoPutError(DynamoPutError),
    /// DynamoDB Scan operation error
    DynamoScanError(DynamoScanError),
    /// DynamoDB BatchWriteItem operation error
    DynamoBatchWriteItemError(DynamoBatchWriteItemError),
    /// DynamoDB BatchGetItem operation error
    DynamoBatchGetItemError(DynamoBatchGetItemError),
    /// A non-SDK store rejected or failed a request
    Store(String),
    /// A chunk request did not complete within the configured timeout
    Timeout(Duration),
    /// A caller supplied an argument outside the accepted domain
    InvalidArgument(String),
    /// A top-level batch operation failed outside of per-chunk handling
    Operation {
        /// Operation name, e.g. `batch_put`
        operation: String,
        /// Underlying cause
        source: Box<Error>,
    },
}

impl Error {
    /// Check if the error is a DynamoDB ConditionalCheckFailedException
    ///
    /// Raised by [`put_item_with_condition`](crate::table::put_item_with_condition)
    /// when an optimistic lock guard no longer matches the stored version.
    ///
    /// # Example
    /// ```no_run
    /// # use dynamo_batch::Error;
    /// # async fn example(error: Error) {
    /// if error.is_conditional_check_failed() {
    ///     // Reload the item and reapply the change
    /// }
    /// # }
    /// ```
    pub fn is_conditional_check_failed(&self) -> bool {
        match self {
            Error::DynamoPutError(dynamo_err) => matches!(
                dynamo_err.as_service_error(),
                Some(PutItemError::ConditionalCheckFailedException(
                    ConditionalCheckFailedException { .. }
                ))
            ),
            Error::Operation { source, .. } => source.is_conditional_check_failed(),
            _ => false,
        }
    }

    /// Check if the error is a serialization/deserialization error
    ///
    /// Serialization failures are never retried by the batch writer.
    pub fn is_serialization_error(&self) -> bool {
        match self {
            Error::SerdeDynamo(_) => true,
            Error::Operation { source, .. } => source.is_serialization_error(),
            _ => false,
        }
    }

    /// Check if the error came from talking to the store for a single request
    ///
    /// These are the failures the batch writer absorbs into its retry buffer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Error::DynamoPutError(_)
                | Error::DynamoScanError(_)
                | Error::DynamoBatchWriteItemError(_)
                | Error::DynamoBatchGetItemError(_)
                | Error::Store(_)
                | Error::Timeout(_)
        )
    }

    pub(crate) fn operation(operation: impl Into<String>, source: Error) -> Self {
        Error::Operation {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}

macro_rules! impl_from_error {
    ($name:ident, $variant:ident) => {
        impl From<$name> for Error {
            fn from(e: $name) -> Self {
                Error::$variant(e)
            }
        }
    };
    ($name:ident) => {
        impl From<$name> for Error {
            fn from(e: $name) -> Self {
                Error::$name(e)
            }
        }
    };
}

impl_from_error!(SerdeDynamoError, SerdeDynamo);
impl_from_error!(BuildError);
impl_from_error!(DynamoPutError);
impl_from_error!(DynamoScanError);
impl_from_error!(DynamoBatchWriteItemError);
impl_from_error!(DynamoBatchGetItemError);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerdeDynamo(e) => write!(f, "DynamoDB serialization error: {}", e),
            Error::BuildError(e) => write!(f, "DynamoDB request builder error: {}", e),
            Error::DynamoPutError(e) => {
                write!(f, "DynamoDB PutItem operation failed: {}", e)
            }
            Error::DynamoScanError(e) => {
                write!(f, "DynamoDB Scan operation failed: {}", e)
            }
            Error::DynamoBatchWriteItemError(e) => {
                write!(f, "DynamoDB BatchWriteItem operation failed: {}", e)
            }
            Error::DynamoBatchGetItemError(e) => {
                write!(f, "DynamoDB BatchGetItem operation failed: {}", e)
            }
            Error::Store(message) => write!(f, "store request failed: {}", message),
            Error::Timeout(after) => write!(f, "store request timed out after {:?}", after),
            Error::InvalidArgument(message) => write!(f, "invalid argument: {}", message),
            Error::Operation { operation, source } => {
                write!(f, "{} operation failed: {}", operation, source)
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::SerdeDynamo(e) => Some(e),
            Error::BuildError(e) => Some(e),
            Error::DynamoPutError(e) => Some(e),
            Error::DynamoScanError(e) => Some(e),
            Error::DynamoBatchWriteItemError(e) => Some(e),
            Error::DynamoBatchGetItemError(e) => Some(e),
            Error::Operation { source, .. } => Some(source.as_ref()),
            Error::Store(_) | Error::Timeout(_) | Error::InvalidArgument(_) => None,
        }
    }
}
