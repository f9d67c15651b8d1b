//! Login state machine
//!
//! [`transition`] is pure: given the step about to run and the page the
//! previous action produced, it returns the next step and the [`Action`] the
//! driver must perform to get there. The CAPTCHA and device-selection loops
//! are self-transitions.
//!
//! ```text
//! LandingPage -> SigninPage -> SubmitCredentials
//!   -> CaptchaChallenge(AfterCredentials) ⟲ -> DeviceSelection ⟲
//!   -> SubmitOtp -> CaptchaChallenge(AfterOtp) ⟲
//!   -> ConfirmAuthenticated -> Authenticated
//! ```

use std::fmt;

use super::page::{DeviceOption, FormData, Page};
use crate::constants::portal;
use crate::errors::StepFailure;

/// Which challenge loop a CAPTCHA step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaPhase {
    AfterCredentials,
    AfterOtp,
}

/// Login step about to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    LandingPage,
    SigninPage,
    SubmitCredentials,
    CaptchaChallenge(CaptchaPhase),
    DeviceSelection,
    SubmitOtp,
    ConfirmAuthenticated,
    Authenticated,
}

impl AuthStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthStep::Authenticated)
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthStep::LandingPage => "landing-page",
            AuthStep::SigninPage => "signin-page",
            AuthStep::SubmitCredentials => "submit-credentials",
            AuthStep::CaptchaChallenge(CaptchaPhase::AfterCredentials) => "captcha-challenge",
            AuthStep::CaptchaChallenge(CaptchaPhase::AfterOtp) => "captcha-challenge-after-otp",
            AuthStep::DeviceSelection => "device-selection",
            AuthStep::SubmitOtp => "submit-otp",
            AuthStep::ConfirmAuthenticated => "confirm-authenticated",
            AuthStep::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

/// Work the driver performs between two steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// GET a path relative to the portal base
    Visit(&'static str),
    /// GET an absolute URL found on the current page
    Follow(url::Url),
    /// Fill in username and password, then POST
    SubmitCredentials(FormData),
    /// Ask for a CAPTCHA answer, fill it in with the credentials, then POST
    SolveCaptcha { image_url: String, form: FormData },
    /// Ask which device should receive the code, then POST the choice
    ChooseDevice {
        form: FormData,
        options: Vec<DeviceOption>,
    },
    /// Ask for the one-time code, then POST
    SubmitOtp(FormData),
    /// GET a protected path and check it was not served from the sign-in page
    Verify(&'static str),
    /// No request; the current page carries into the next step
    Continue,
    /// Authentication finished
    Done,
}

/// Decides the next step and action
///
/// # Errors
///
/// Returns a `StepFailure` when the page lacks what the step needs
pub fn transition(step: AuthStep, page: Option<&Page>) -> Result<(AuthStep, Action), StepFailure> {
    match step {
        AuthStep::LandingPage => Ok((AuthStep::SigninPage, Action::Visit(portal::LANDING_PATH))),

        AuthStep::SigninPage => {
            let link = page
                .and_then(Page::signin_link)
                .ok_or(StepFailure::SigninLinkNotFound)?;
            Ok((AuthStep::SubmitCredentials, Action::Follow(link)))
        }

        AuthStep::SubmitCredentials => {
            let form = page
                .and_then(Page::submit_form)
                .ok_or(StepFailure::FormNotFound)?;
            Ok((
                AuthStep::CaptchaChallenge(CaptchaPhase::AfterCredentials),
                Action::SubmitCredentials(form),
            ))
        }

        AuthStep::CaptchaChallenge(phase) => match page.and_then(Page::captcha_image) {
            Some(image_url) => {
                let form = page
                    .and_then(Page::submit_form)
                    .ok_or(StepFailure::FormNotFound)?;
                Ok((step, Action::SolveCaptcha { image_url, form }))
            }
            None => {
                let next = match phase {
                    CaptchaPhase::AfterCredentials => AuthStep::DeviceSelection,
                    CaptchaPhase::AfterOtp => AuthStep::ConfirmAuthenticated,
                };
                Ok((next, Action::Continue))
            }
        },

        AuthStep::DeviceSelection => match page.and_then(Page::device_selection) {
            Some((_, options)) if options.is_empty() => Err(StepFailure::DeviceOptionsNotFound),
            Some((form, options)) => Ok((step, Action::ChooseDevice { form, options })),
            None => Ok((AuthStep::SubmitOtp, Action::Continue)),
        },

        AuthStep::SubmitOtp => {
            let next = AuthStep::CaptchaChallenge(CaptchaPhase::AfterOtp);
            match page.and_then(Page::otp_form) {
                Some(form) => Ok((next, Action::SubmitOtp(form))),
                None => Ok((next, Action::Continue)),
            }
        }

        AuthStep::ConfirmAuthenticated => Ok((
            AuthStep::Authenticated,
            Action::Verify(portal::LIBRARY_PATH),
        )),

        AuthStep::Authenticated => Ok((AuthStep::Authenticated, Action::Done)),
    }
}

/// Whether a protected resource was actually served
///
/// The portal answers unauthenticated requests by redirecting to the sign-in
/// path, so landing there means the session is not logged in.
pub fn is_verified(page: &Page) -> bool {
    page.path() != portal::SIGNIN_PATH
}
