//! Portal login flow
//!
//! [`AuthSession`] drives the [`state`] machine: it asks [`state::transition`]
//! what to do next, performs the request, consults the [`Prompter`] for
//! CAPTCHA answers, device choices and one-time codes, and feeds the
//! resulting page back in. Any step failure aborts the whole sequence;
//! nothing is retried automatically.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use audible_fetcher::app::auth::{AuthSession, Credentials, NoPrompter};
//! use audible_fetcher::app::client::PortalClient;
//!
//! # async fn example(client: PortalClient) -> Result<(), Box<dyn std::error::Error>> {
//! let credentials = Credentials::new("user@example.com", "secret");
//! let session = AuthSession::new(client, credentials, Arc::new(NoPrompter));
//! let client = session.authenticate().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::app::client::PortalClient;
use crate::constants::portal;
use crate::errors::{AuthError, AuthResult, SendError, StepFailure};

pub mod page;
pub mod prompt;
pub mod state;

pub use page::{DeviceOption, FormData, Page};
pub use prompt::{NoPrompter, Prompter};
pub use state::{transition, Action, AuthStep, CaptchaPhase};

/// Portal username and password
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Both values must be non-empty
    pub fn validate(&self) -> AuthResult<()> {
        if self.username.trim().is_empty() || self.password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One login attempt against the portal
pub struct AuthSession {
    client: PortalClient,
    credentials: Credentials,
    prompter: Arc<dyn Prompter>,
    step: AuthStep,
    page: Option<Page>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("step", &self.step)
            .field("page", &self.page.as_ref().map(|p| p.url.as_str()))
            .finish_non_exhaustive()
    }
}

impl AuthSession {
    pub fn new(client: PortalClient, credentials: Credentials, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            client,
            credentials,
            prompter,
            step: AuthStep::LandingPage,
            page: None,
        }
    }

    /// Step that will run next
    pub fn step(&self) -> AuthStep {
        self.step
    }

    /// Last page received
    pub fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    /// Runs every step and returns the now-authenticated client
    ///
    /// # Errors
    ///
    /// Returns `AuthError::StepFailed` naming the failing step,
    /// `AuthError::Cancelled` if the run is interrupted, or
    /// `AuthError::MissingCredentials` for empty credentials
    pub async fn authenticate(mut self) -> AuthResult<PortalClient> {
        self.credentials.validate()?;
        info!("Signing in to {}", self.client.base_url());

        while !self.advance().await? {}

        info!("Authenticated with {}", self.client.base_url());
        Ok(self.client)
    }

    /// Runs a single step; returns `true` once authenticated
    pub async fn advance(&mut self) -> AuthResult<bool> {
        if self.client.is_cancelled() {
            return Err(AuthError::Cancelled);
        }

        let current = self.step;
        if current.is_terminal() {
            return Ok(true);
        }

        let (next, action) = transition(current, self.page.as_ref())
            .map_err(|cause| AuthError::step(current, cause))?;
        debug!("auth step {} -> {}", current, next);

        self.perform(current, action).await?;
        self.step = next;
        Ok(self.step.is_terminal())
    }

    async fn perform(&mut self, current: AuthStep, action: Action) -> AuthResult<()> {
        match action {
            Action::Visit(path) => {
                let url = self.resolve(path)?;
                self.fetch(current, url).await?;
            }
            Action::Follow(url) => {
                self.fetch(current, url).await?;
            }
            Action::SubmitCredentials(mut form) => {
                self.fill_credentials(&mut form);
                self.submit(current, form).await?;
            }
            Action::SolveCaptcha {
                image_url,
                mut form,
            } => {
                if let Some(message) = self.page.as_ref().and_then(Page::message_box) {
                    warn!("{}", message);
                }
                let answer = self
                    .ask(move |p| p.captcha(&image_url))
                    .await?
                    .ok_or_else(|| AuthError::step(current, StepFailure::CaptchaHandlerMissing))?;
                self.fill_credentials(&mut form);
                form.set(portal::CAPTCHA_FIELD, answer);
                self.submit(current, form).await?;
            }
            Action::ChooseDevice { mut form, options } => {
                let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
                let index = self
                    .ask(move |p| p.choose(portal::DEVICE_CHOICE_MESSAGE, &labels))
                    .await?
                    .ok_or_else(|| AuthError::step(current, StepFailure::ChoiceHandlerMissing))?;
                let option = options.get(index).ok_or_else(|| {
                    AuthError::step(
                        current,
                        StepFailure::InvalidChoice {
                            index,
                            count: options.len(),
                        },
                    )
                })?;
                form.set(&option.name, option.value.clone());
                self.submit(current, form).await?;
            }
            Action::SubmitOtp(mut form) => {
                let code = self
                    .ask(|p| p.one_time_code())
                    .await?
                    .ok_or_else(|| AuthError::step(current, StepFailure::OtpHandlerMissing))?;
                form.set(portal::OTP_FIELD, code.trim());
                self.submit(current, form).await?;
            }
            Action::Verify(path) => {
                let url = self.resolve(path)?;
                let page = self.fetch(current, url).await?;
                if !state::is_verified(page) {
                    return Err(AuthError::step(current, StepFailure::VerificationFailed));
                }
            }
            Action::Continue | Action::Done => {}
        }
        Ok(())
    }

    fn resolve(&self, path: &str) -> AuthResult<url::Url> {
        self.client.resolve(path).map_err(|e| AuthError::InvalidUrl {
            url: path.to_string(),
            error: e.to_string(),
        })
    }

    fn fill_credentials(&self, form: &mut FormData) {
        form.set(portal::EMAIL_FIELD, self.credentials.username.clone());
        form.set(portal::PASSWORD_FIELD, self.credentials.password.clone());
    }

    async fn fetch(&mut self, current: AuthStep, url: url::Url) -> AuthResult<&Page> {
        let request = self.client.get(url);
        self.load(current, request).await
    }

    async fn submit(&mut self, current: AuthStep, form: FormData) -> AuthResult<()> {
        let referer = match &self.page {
            Some(page) => page.url.clone(),
            None => self.client.base_url().clone(),
        };
        let request = self.client.post_form(form.action, &referer, &form.fields);
        let page = self.load(current, request).await?;
        if let Some(message) = page.message_box() {
            warn!("{}", message);
        }
        Ok(())
    }

    async fn load(
        &mut self,
        current: AuthStep,
        request: reqwest::RequestBuilder,
    ) -> AuthResult<&Page> {
        let (url, body) = self
            .client
            .send_text(request)
            .await
            .map_err(|e| match e {
                SendError::Cancelled => AuthError::Cancelled,
                SendError::Http(e) => AuthError::step(current, e),
            })?;
        Ok(self.page.insert(Page::new(url, body)))
    }

    /// Runs a prompter call on a blocking thread, abandoning it on cancellation
    async fn ask<T, F>(&self, question: F) -> AuthResult<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Prompter) -> Option<T> + Send + 'static,
    {
        let prompter = Arc::clone(&self.prompter);
        let task = tokio::task::spawn_blocking(move || question(prompter.as_ref()));
        match self.client.cancellable(task).await {
            Err(_) => Err(AuthError::Cancelled),
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(e)) => {
                warn!("Prompt failed: {}", e);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mockito::{Matcher, Server, ServerGuard};
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use crate::app::client::{ClientConfig, PersistentCookieStore};

    #[derive(Default)]
    struct CountingPrompter {
        captchas: AtomicUsize,
        codes: AtomicUsize,
        choices: AtomicUsize,
    }

    impl Prompter for CountingPrompter {
        fn captcha(&self, image_url: &str) -> Option<String> {
            assert!(image_url.ends_with("/captcha.jpg"));
            let n = self.captchas.fetch_add(1, Ordering::SeqCst) + 1;
            Some(format!("answer{}", n))
        }

        fn one_time_code(&self) -> Option<String> {
            self.codes.fetch_add(1, Ordering::SeqCst);
            Some("123456".to_string())
        }

        fn choose(&self, _message: &str, options: &[String]) -> Option<usize> {
            self.choices.fetch_add(1, Ordering::SeqCst);
            options.iter().position(|o| o.contains("Authenticator"))
        }
    }

    fn client_for(server: &ServerGuard, cancel: CancellationToken) -> PortalClient {
        PortalClient::new(
            Url::parse(&server.url()).unwrap(),
            &ClientConfig::default(),
            Arc::new(PersistentCookieStore::in_memory()),
            cancel,
        )
        .unwrap()
    }

    fn captcha_page(action: &str) -> String {
        format!(
            r##"<form method="post" action="{action}">
                 <input type="hidden" name="cvf_captcha_captcha_token" value="t">
                 <img src="/captcha.jpg"><a href="#">Try different image</a>
                 <input name="cvf_captcha_input"></form>"##
        )
    }

    async fn mock_landing_and_signin(server: &mut ServerGuard) {
        server
            .mock("GET", "/")
            .match_query(Matcher::UrlEncoded("ipRedirectOverride".into(), "true".into()))
            .with_body(r#"<a class="ui-it-sign-in-link" href="/signin">Sign In</a>"#)
            .create_async()
            .await;
        server
            .mock("GET", "/signin")
            .with_body(
                r#"<form name="signIn" method="post" action="/ap/signin-submit">
                     <input type="hidden" name="appActionToken" value="abc">
                     <input type="email" name="email"><input type="password" name="password">
                   </form>"#,
            )
            .create_async()
            .await;
    }

    #[tokio::test]
    async fn test_full_flow_with_two_captchas() {
        let mut server = Server::new_async().await;
        mock_landing_and_signin(&mut server).await;

        let credentials = server
            .mock("POST", "/ap/signin-submit")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("email".into(), "user@example.com".into()),
                Matcher::UrlEncoded("password".into(), "secret".into()),
                Matcher::UrlEncoded("appActionToken".into(), "abc".into()),
            ]))
            .with_body(captcha_page("/captcha-1"))
            .create_async()
            .await;
        let first = server
            .mock("POST", "/captcha-1")
            .match_body(Matcher::UrlEncoded("cvf_captcha_input".into(), "answer1".into()))
            .with_body(captcha_page("/captcha-2"))
            .create_async()
            .await;
        let second = server
            .mock("POST", "/captcha-2")
            .match_body(Matcher::UrlEncoded("cvf_captcha_input".into(), "answer2".into()))
            .with_body(
                r#"<form id="auth-select-device-form" method="post" action="/select-device">
                     <fieldset>
                       <div><input type="radio" name="otpDeviceContext" value="sms"> SMS</div>
                       <div><input type="radio" name="otpDeviceContext" value="totp"> Authenticator App</div>
                     </fieldset></form>"#,
            )
            .create_async()
            .await;
        let device = server
            .mock("POST", "/select-device")
            .match_body(Matcher::UrlEncoded("otpDeviceContext".into(), "totp".into()))
            .with_body(
                r#"<form id="auth-mfa-form" method="post" action="/mfa"><input name="otpCode"></form>"#,
            )
            .create_async()
            .await;
        let otp = server
            .mock("POST", "/mfa")
            .match_body(Matcher::UrlEncoded("otpCode".into(), "123456".into()))
            .with_body("<p>Welcome back</p>")
            .expect(1)
            .create_async()
            .await;
        let library = server
            .mock("GET", "/lib")
            .with_body("<p>Your library</p>")
            .create_async()
            .await;

        let prompter = Arc::new(CountingPrompter::default());
        let session = AuthSession::new(
            client_for(&server, CancellationToken::new()),
            Credentials::new("user@example.com", "secret"),
            prompter.clone(),
        );
        session.authenticate().await.unwrap();

        assert_eq!(prompter.captchas.load(Ordering::SeqCst), 2);
        assert_eq!(prompter.choices.load(Ordering::SeqCst), 1);
        assert_eq!(prompter.codes.load(Ordering::SeqCst), 1);
        for mock in [credentials, first, second, device, otp, library] {
            mock.assert_async().await;
        }
    }

    #[tokio::test]
    async fn test_captcha_without_handler_fails() {
        let mut server = Server::new_async().await;
        mock_landing_and_signin(&mut server).await;
        server
            .mock("POST", "/ap/signin-submit")
            .with_body(captcha_page("/captcha-1"))
            .create_async()
            .await;

        let session = AuthSession::new(
            client_for(&server, CancellationToken::new()),
            Credentials::new("user@example.com", "secret"),
            Arc::new(NoPrompter),
        );
        let err = session.authenticate().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::StepFailed {
                step: AuthStep::CaptchaChallenge(CaptchaPhase::AfterCredentials),
                cause: StepFailure::CaptchaHandlerMissing,
            }
        ));
    }

    #[tokio::test]
    async fn test_redirect_to_signin_fails_verification() {
        let mut server = Server::new_async().await;
        mock_landing_and_signin(&mut server).await;
        server
            .mock("POST", "/ap/signin-submit")
            .with_body("<p>ok</p>")
            .create_async()
            .await;
        server
            .mock("GET", "/lib")
            .with_status(302)
            .with_header("location", "/ap/signin")
            .create_async()
            .await;
        server
            .mock("GET", "/ap/signin")
            .with_body("<p>sign in again</p>")
            .create_async()
            .await;

        let session = AuthSession::new(
            client_for(&server, CancellationToken::new()),
            Credentials::new("user@example.com", "secret"),
            Arc::new(NoPrompter),
        );
        let err = session.authenticate().await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::StepFailed {
                step: AuthStep::ConfirmAuthenticated,
                cause: StepFailure::VerificationFailed,
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_signin_link_names_step() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/")
            .match_query(Matcher::Any)
            .with_body("<p>no link</p>")
            .create_async()
            .await;

        let mut session = AuthSession::new(
            client_for(&server, CancellationToken::new()),
            Credentials::new("user@example.com", "secret"),
            Arc::new(NoPrompter),
        );
        assert!(!session.advance().await.unwrap());
        assert_eq!(session.step(), AuthStep::SigninPage);

        let err = session.advance().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "authentication step signin-page failed: unable to find the sign in link"
        );
    }

    #[tokio::test]
    async fn test_cancelled_session_stops_immediately() {
        let mut server = Server::new_async().await;
        let landing = server
            .mock("GET", "/")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let session = AuthSession::new(
            client_for(&server, cancel),
            Credentials::new("user@example.com", "secret"),
            Arc::new(NoPrompter),
        );
        assert!(matches!(
            session.authenticate().await,
            Err(AuthError::Cancelled)
        ));
        landing.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_credentials_rejected() {
        let server = Server::new_async().await;
        let session = AuthSession::new(
            client_for(&server, CancellationToken::new()),
            Credentials::new("", ""),
            Arc::new(NoPrompter),
        );
        assert!(matches!(
            session.authenticate().await,
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("user", "hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
