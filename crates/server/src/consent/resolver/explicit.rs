//! Explicit consent: every new authorization needs an interactive decision.

use uuid::Uuid;

use super::{Resolution, ResolverContext, challenge_of};
use crate::entity::consent_session;
use crate::error::ConsentError;

pub async fn resolve(
    ctx: &ResolverContext<'_>,
    challenge_id: Option<Uuid>,
) -> Result<Resolution, ConsentError> {
    let session = match challenge_id {
        Some(id) => ctx.load_session(id).await?,
        None if ctx.request.has_prompt("none") => return Err(ConsentError::ConsentRequired),
        None => ctx.create_session().await?,
    };

    if let Some(redirect) = ctx.reauthentication(&session)? {
        return Ok(redirect);
    }
    interactive(ctx, session)
}

/// Proceed with a responded session, otherwise ask the user. Loaded
/// sessions that were denied never get here.
pub(super) fn interactive(
    ctx: &ResolverContext<'_>,
    session: consent_session::Model,
) -> Result<Resolution, ConsentError> {
    if session.is_responded() {
        return Ok(Resolution::Proceed(session));
    }
    if ctx.request.has_prompt("none") {
        return Err(ConsentError::ConsentRequired);
    }
    let challenge_id = challenge_of(&session)?;
    Ok(Resolution::Redirect(ctx.endpoints.consent(challenge_id)))
}
