//! Custom validation functions for configuration.

use validator::ValidationError;

use crate::thread::{SchedPolicy, ThreadConfig};

/// Granularity thread stacks must be sized in.
pub const STACK_ALIGNMENT: usize = 4096;

/// Smallest stack a managed thread may request.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// Validate that a requested stack size is page aligned and not too small.
pub fn validate_stack_size(size: usize) -> Result<(), ValidationError> {
    if size < MIN_STACK_SIZE {
        return Err(ValidationError::new("stack_too_small"));
    }
    if size % STACK_ALIGNMENT != 0 {
        return Err(ValidationError::new("stack_not_aligned"));
    }
    Ok(())
}

/// Validate that the priority fits the range of the scheduling policy.
pub fn validate_priority(policy: SchedPolicy, priority: u8) -> Result<(), ValidationError> {
    let (min, max) = policy.priority_range();
    if (min..=max).contains(&priority) {
        Ok(())
    } else {
        Err(ValidationError::new("priority_out_of_range"))
    }
}

/// Struct-level check for [`ThreadConfig`].
pub fn validate_thread_config(config: &ThreadConfig) -> Result<(), ValidationError> {
    if let Some(size) = config.stack_size {
        validate_stack_size(size)?;
    }
    validate_priority(config.policy, config.priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_size_rules() {
        assert!(validate_stack_size(64 * 1024).is_ok());
        assert_eq!(
            validate_stack_size(8 * 1024).unwrap_err().code,
            "stack_too_small"
        );
        assert_eq!(
            validate_stack_size(MIN_STACK_SIZE + 1).unwrap_err().code,
            "stack_not_aligned"
        );
    }

    #[test]
    fn priority_follows_policy() {
        assert!(validate_priority(SchedPolicy::Other, 0).is_ok());
        assert!(validate_priority(SchedPolicy::Other, 5).is_err());
        assert!(validate_priority(SchedPolicy::Fifo, 0).is_err());
        assert!(validate_priority(SchedPolicy::Fifo, 99).is_ok());
        assert!(validate_priority(SchedPolicy::RoundRobin, 100).is_err());
    }
}
