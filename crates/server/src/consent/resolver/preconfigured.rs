//! Pre-configured consent: reuse a remembered decision for identical
//! requests.

use uuid::Uuid;

use super::{Resolution, ResolverContext, approval, explicit};
use crate::entity::{consent_preconfiguration, join_set};
use crate::error::ConsentError;

pub async fn resolve(
    ctx: &ResolverContext<'_>,
    challenge_id: Option<Uuid>,
) -> Result<Resolution, ConsentError> {
    if ctx.request.has_prompt("consent") {
        return explicit::resolve(ctx, challenge_id).await;
    }

    let session = match challenge_id {
        Some(id) => ctx.load_session(id).await?,
        None => {
            let scopes = join_set(&ctx.request.scopes);
            let audience = join_set(&ctx.request.audience);
            if ctx.request.has_prompt("none")
                && find_matching(ctx, &scopes, &audience).await?.is_none()
            {
                return Err(ConsentError::ConsentRequired);
            }
            ctx.create_session().await?
        }
    };
    if let Some(redirect) = ctx.reauthentication(&session)? {
        return Ok(redirect);
    }
    if session.is_responded() {
        return Ok(Resolution::Proceed(session));
    }

    let Some(preconfiguration) =
        find_matching(ctx, &session.requested_scopes, &session.requested_audience).await?
    else {
        return explicit::interactive(ctx, session);
    };

    let mut response = approval(
        ctx.client,
        &session,
        preconfiguration.granted_claims.clone(),
        ctx.now,
    );
    response.preconfiguration_id = Some(preconfiguration.id);
    let session = ctx.respond(&session, response).await?;

    tracing::info!(
        target: "audit",
        challenge_id = %session.challenge_id,
        preconfiguration_id = preconfiguration.id,
        "Consent pre-configuration used"
    );
    Ok(Resolution::Proceed(session))
}

/// A usable pre-configuration whose scopes, audience and claims signature
/// all equal the requested ones. Overlap is never enough.
pub async fn find_matching(
    ctx: &ResolverContext<'_>,
    scopes: &str,
    audience: &str,
) -> Result<Option<consent_preconfiguration::Model>, ConsentError> {
    let signature = ctx.request.claims_signature();
    let candidates = ctx
        .store
        .find_preconfigurations(&ctx.client.id, ctx.subject, ctx.now)
        .await?;

    Ok(candidates.into_iter().find(|p| {
        p.is_usable_at(ctx.now)
            && p.scopes == scopes
            && p.audience == audience
            && p.claims_signature == signature
    }))
}
