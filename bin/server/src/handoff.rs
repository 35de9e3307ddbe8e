//! Browser-side login hand-off page.
//!
//! When no downstream cookie can be set from the relay, the browser posts
//! the one-time credentials to the downstream login endpoint itself and then
//! navigates to the landing page.

use html_escape::encode_quoted_attribute;
use sso_relay_coordination::DownstreamCredentials;

/// Renders the auto-submitting login form.
#[must_use]
pub fn form_login_page(
    login_url: &str,
    landing_url: &str,
    credentials: &DownstreamCredentials,
) -> String {
    let login_url = encode_quoted_attribute(login_url);
    let landing_url = encode_quoted_attribute(landing_url);
    let email = encode_quoted_attribute(&credentials.email);
    let password = encode_quoted_attribute(&credentials.password);

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Signing you in...</title>
</head>
<body>
    <div style="text-align: center; padding: 50px; font-family: sans-serif;">
        <h2>Completing your login...</h2>
        <p>You will be redirected in a moment.</p>
    </div>
    <iframe name="login-target" style="display: none;"></iframe>
    <form id="login-form" method="POST" action="{login_url}" target="login-target" style="display: none;">
        <input type="hidden" name="emailOrLdapLoginId" value="{email}">
        <input type="hidden" name="password" value="{password}">
    </form>
    <a id="landing" href="{landing_url}" style="display: none;"></a>
    <script>
        document.getElementById('login-form').submit();
        setTimeout(function () {{
            window.location.href = document.getElementById('landing').href;
        }}, 1000);
    </script>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_quotes_cannot_break_out_of_attributes() {
        let credentials = DownstreamCredentials {
            email: "o'brien@example.com".to_string(),
            password: "a'b&c".to_string(),
        };
        let page = form_login_page(
            "https://n8n.example.com/rest/login",
            "https://n8n.example.com/home/workflows",
            &credentials,
        );
        assert!(!page.contains("o'brien"));
        assert!(!page.contains("a'b"));
        assert!(page.contains("&amp;c"));
    }

    #[test]
    fn form_page_escapes_credentials() {
        let credentials = DownstreamCredentials {
            email: "ada@example.com".to_string(),
            password: r#"p"><script>alert(1)</script>"#.to_string(),
        };
        let page = form_login_page(
            "https://n8n.example.com/rest/login",
            "https://n8n.example.com/home/workflows",
            &credentials,
        );
        assert!(page.contains(r#"action="https://n8n.example.com/rest/login""#));
        assert!(page.contains(r#"name="emailOrLdapLoginId" value="ada@example.com""#));
        assert!(page.contains("p&quot;&gt;&lt;script&gt;"));
        assert!(!page.contains("<script>alert(1)</script>"));
        assert!(page.contains(r#"href="https://n8n.example.com/home/workflows""#));
    }
}
