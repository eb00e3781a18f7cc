//! Typed ID definitions for fleet resources.

use crate::define_id;

define_id!(TenantId, "tnt");
define_id!(JobId, "job");
define_id!(RolloutId, "rol");
define_id!(RequestId, "req");
