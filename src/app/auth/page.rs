//! Inspection of portal HTML pages
//!
//! A [`Page`] keeps the final URL and raw body of a response. Every query
//! parses the body on demand and returns owned data, so no parsed document is
//! ever held across an await point.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::constants::portal;

/// A fetched portal page
#[derive(Debug, Clone)]
pub struct Page {
    /// URL the response was finally served from, after redirects
    pub url: Url,
    pub body: String,
}

/// Action URL plus the fields a form submits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormData {
    pub action: Url,
    pub fields: Vec<(String, String)>,
}

impl FormData {
    /// Set a field; other fields of the same name (radio groups) are dropped
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let mut value = Some(value.into());
        self.fields.retain_mut(|(n, v)| {
            if n != name {
                return true;
            }
            match value.take() {
                Some(new) => {
                    *v = new;
                    true
                }
                None => false,
            }
        });
        if let Some(value) = value {
            self.fields.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One selectable way to receive a one-time code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOption {
    pub label: String,
    pub name: String,
    pub value: String,
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

/// Element text with runs of whitespace collapsed
fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

impl Page {
    pub fn new(url: Url, body: impl Into<String>) -> Self {
        Self {
            url,
            body: body.into(),
        }
    }

    fn document(&self) -> Html {
        Html::parse_document(&self.body)
    }

    /// Path component of the final URL
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Resolve a reference found on this page
    fn resolve(&self, reference: &str) -> Option<Url> {
        self.url.join(reference.trim()).ok()
    }

    /// Collects a form's action and every named input as the base payload
    fn parse_form(&self, form: ElementRef<'_>) -> Option<FormData> {
        let action = self.resolve(form.value().attr("action").unwrap_or_default())?;
        let inputs = selector("input")?;
        let fields = form
            .select(&inputs)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                (!name.is_empty()).then(|| {
                    (
                        name.to_string(),
                        input.value().attr("value").unwrap_or_default().to_string(),
                    )
                })
            })
            .collect();
        Some(FormData { action, fields })
    }

    /// Sign-in link on the landing page
    pub fn signin_link(&self) -> Option<Url> {
        let doc = self.document();
        let link = doc.select(&selector(portal::SIGNIN_LINK_SELECTOR)?).next()?;
        self.resolve(link.value().attr("href")?)
    }

    /// First form that declares a submit method
    pub fn submit_form(&self) -> Option<FormData> {
        let doc = self.document();
        let form = doc.select(&selector(portal::SUBMIT_FORM_SELECTOR)?).next()?;
        self.parse_form(form)
    }

    /// Challenge image URL, present only while the page also offers a
    /// different image
    pub fn captcha_image(&self) -> Option<String> {
        let doc = self.document();
        let image = doc.select(&selector(portal::CAPTCHA_IMAGE_SELECTOR)?).next()?;
        let refresh = selector(portal::FORM_LINK_SELECTOR)?;
        let offers_refresh = doc
            .select(&refresh)
            .any(|a| text_of(a) == portal::CAPTCHA_REFRESH_TEXT);
        if !offers_refresh {
            return None;
        }

        let src = image.value().attr("src").unwrap_or_default();
        Some(
            self.resolve(src)
                .map(|u| u.to_string())
                .unwrap_or_else(|| src.to_string()),
        )
    }

    /// Device selection form and its options
    ///
    /// Returns `Some` with an empty option list when the form is present but
    /// carries no radio inputs.
    pub fn device_selection(&self) -> Option<(FormData, Vec<DeviceOption>)> {
        let doc = self.document();
        let form = doc.select(&selector(portal::DEVICE_FORM_SELECTOR)?).next()?;
        let data = self.parse_form(form)?;

        let rows = selector(portal::DEVICE_OPTION_SELECTOR)?;
        let radio = selector(portal::RADIO_SELECTOR)?;
        let options = form
            .select(&rows)
            .filter_map(|row| {
                let input = row.select(&radio).next()?;
                Some(DeviceOption {
                    label: text_of(row),
                    name: input.value().attr("name").unwrap_or_default().to_string(),
                    value: input.value().attr("value").unwrap_or_default().to_string(),
                })
            })
            .collect();

        Some((data, options))
    }

    /// One-time-code form, if the page asks for a code
    pub fn otp_form(&self) -> Option<FormData> {
        let doc = self.document();
        let form = doc.select(&selector(portal::OTP_FORM_SELECTOR)?).next()?;
        form.select(&selector(portal::OTP_INPUT_SELECTOR)?).next()?;
        self.parse_form(form)
    }

    /// Heading and items of the login message box, as `heading: a, b`
    pub fn message_box(&self) -> Option<String> {
        let doc = self.document();
        let div = doc.select(&selector(portal::MESSAGE_BOX_SELECTOR)?).next()?;

        let heading = selector("h4")
            .and_then(|h4| div.select(&h4).next())
            .map(text_of)
            .unwrap_or_default();
        let items: Vec<String> = selector("ul li")
            .map(|li| {
                div.select(&li)
                    .map(text_of)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if heading.is_empty() && items.is_empty() {
            return None;
        }
        Some(format!("{}: {}", heading, items.join(", ")))
    }
}
