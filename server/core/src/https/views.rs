//! Minimal server-rendered documents: the login method picker, the consent
//! form, the auto-submitting `form_post` response and the small terminal
//! pages. No template engine, just escaped string assembly.

use axum::response::Html;

use tunnistamod_lib::idm::clients::LoginMethod;

pub(crate) fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>{}</body></html>\n",
        escape(title),
        body
    ))
}

pub(crate) fn login_picker(methods: &[LoginMethod], next: Option<&str>) -> Html<String> {
    let mut body = String::from("<h1>Sign in</h1>\n<ul>\n");
    for method in methods {
        let mut href = format!("/accounts/{}/login/", method.provider_id);
        if let Some(next) = next {
            href.push_str("?next=");
            href.push_str(&urlencode(next));
        }
        body.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            escape(&href),
            escape(&method.display)
        ));
    }
    body.push_str("</ul>\n");
    page("Sign in", &body)
}

pub(crate) fn consent_form(
    client_name: &str,
    scope_names: &[String],
    action_query: &str,
    consent_token: &str,
    csrf_token: &str,
) -> Html<String> {
    let mut body = format!(
        "<h1>Authorise {}</h1>\n<p>The application requests access to:</p>\n<ul>\n",
        escape(client_name)
    );
    for name in scope_names {
        body.push_str(&format!("<li>{}</li>\n", escape(name)));
    }
    body.push_str(&format!(
        "</ul>\n<form method=\"post\" action=\"/openid/authorize?{}\">\n\
         <input type=\"hidden\" name=\"consent_token\" value=\"{}\">\n\
         <input type=\"hidden\" name=\"csrfmiddlewaretoken\" value=\"{}\">\n\
         <button type=\"submit\" name=\"allow\" value=\"true\">Allow</button>\n\
         </form>\n",
        escape(action_query),
        escape(consent_token),
        escape(csrf_token)
    ));
    page("Authorise", &body)
}

/// OAuth 2.0 Form Post Response Mode: a self-submitting form back to the
/// client's redirect uri.
pub(crate) fn form_post(redirect_uri: &str, fields: &[(&str, String)]) -> Html<String> {
    let mut inputs = String::new();
    for (name, value) in fields {
        inputs.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\">\n",
            escape(name),
            escape(value)
        ));
    }
    let body = format!(
        "<form method=\"post\" action=\"{}\">\n{}</form>\n\
         <script>document.forms[0].submit();</script>",
        escape(redirect_uri),
        inputs
    );
    page("Submitting", &body)
}

pub(crate) fn logged_out() -> Html<String> {
    page("Signed out", "<h1>You have been signed out.</h1>")
}

pub(crate) fn email_required(reauth_href: &str) -> Html<String> {
    page(
        "Email address needed",
        &format!(
            "<h1>An email address is required</h1>\n\
             <p>Your login did not provide an email address.</p>\n\
             <p><a href=\"{}\">Try again and grant access to your email</a></p>",
            escape(reauth_href)
        ),
    )
}

pub(crate) fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
