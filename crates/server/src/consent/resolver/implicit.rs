//! Implicit consent: decisions are recorded without an interactive screen.

use uuid::Uuid;

use super::{Resolution, ResolverContext, approval, explicit};
use crate::consent::{ConsentRequest, RESPONSE_TYPE_CODE, SCOPE_OFFLINE_ACCESS};
use crate::error::ConsentError;

/// `prompt=consent`, and offline access through the code flow, always get
/// an interactive decision.
pub fn requires_interaction(request: &ConsentRequest) -> bool {
    request.has_prompt("consent")
        || (request.has_scope(SCOPE_OFFLINE_ACCESS) && request.has_response_type(RESPONSE_TYPE_CODE))
}

pub async fn resolve(
    ctx: &ResolverContext<'_>,
    challenge_id: Option<Uuid>,
) -> Result<Resolution, ConsentError> {
    if requires_interaction(ctx.request) {
        return explicit::resolve(ctx, challenge_id).await;
    }

    let session = ctx.obtain_session(challenge_id).await?;
    if let Some(redirect) = ctx.reauthentication(&session)? {
        return Ok(redirect);
    }
    if session.is_responded() {
        return Ok(Resolution::Proceed(session));
    }

    let response = approval(ctx.client, &session, ctx.request.requested_claims(), ctx.now);
    let session = ctx.respond(&session, response).await?;
    Ok(Resolution::Proceed(session))
}
