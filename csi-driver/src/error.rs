//! Maps `appliance_client::ApplianceError` onto `tonic::Status` codes at the
//! CSI RPC boundary.

use appliance_client::ApplianceError;
use tonic::Status;

pub fn to_status(err: ApplianceError) -> Status {
    match err {
        ApplianceError::InvalidArgument(msg) => Status::invalid_argument(msg),
        ApplianceError::AlreadyExists(msg) => Status::already_exists(msg),
        ApplianceError::NotFound(msg) => Status::not_found(msg),
        ApplianceError::FailedPrecondition(msg) => Status::failed_precondition(msg),
        ApplianceError::NetworkRetryable(msg) => Status::unavailable(msg),
        ApplianceError::ApiRetryable(msg) => Status::unavailable(msg),
        ApplianceError::BusyResource(msg) => Status::unavailable(msg),
        ApplianceError::Unauthenticated => Status::unauthenticated("not authenticated with appliance"),
        ApplianceError::Canceled => Status::cancelled("operation canceled"),
        ApplianceError::ApiPermanent(msg) => Status::internal(msg),
        ApplianceError::RetriesExhausted { attempts, source } => {
            Status::unavailable(format!("failed after {attempts} attempts: {source}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_found() {
        let status = to_status(ApplianceError::NotFound("tank/x".into()));
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn maps_busy_to_unavailable() {
        let status = to_status(ApplianceError::BusyResource("dataset is busy".into()));
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[test]
    fn maps_api_permanent_to_internal() {
        let status = to_status(ApplianceError::ApiPermanent("encryption key required".into()));
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
