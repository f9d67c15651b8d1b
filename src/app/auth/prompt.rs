//! Human-in-the-loop capabilities used during login

/// Answers the questions the login flow cannot answer itself
///
/// Each method returns `None` when the implementation cannot handle that
/// interaction; the login step then fails with the matching "handler missing"
/// error. Methods are called from a blocking thread, so implementations may
/// read from the terminal directly.
pub trait Prompter: Send + Sync {
    /// Answer for the challenge image at `image_url`
    fn captcha(&self, _image_url: &str) -> Option<String> {
        None
    }

    /// One-time code from the second factor
    fn one_time_code(&self) -> Option<String> {
        None
    }

    /// Index into `options`
    fn choose(&self, _message: &str, _options: &[String]) -> Option<usize> {
        None
    }
}

/// Prompter that handles nothing, for unattended runs with a cached session
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompter;

impl Prompter for NoPrompter {}
