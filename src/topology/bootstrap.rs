//! Instance bootstrap content.

/// Inputs for a web instance's first-boot script.
#[derive(Debug, Clone)]
pub struct BootstrapContext<'a> {
    /// Stack name shown on the page.
    pub stack: &'a str,
    /// Instance label, e.g. `web-1`.
    pub instance: &'a str,
    /// Page heading.
    pub title: &'a str,
    /// HTTP port to listen on.
    pub port: u16,
}

/// Renders the cloud-init shell script that installs a web server and
/// publishes a landing page identifying the instance.
#[must_use]
pub fn render_user_data(ctx: &BootstrapContext<'_>) -> String {
    let page = render_page(ctx);
    let port = ctx.port;
    format!(
        r#"#!/bin/bash
set -euo pipefail
if command -v dnf >/dev/null 2>&1; then dnf install -y httpd; else yum install -y httpd; fi
sed -i 's/^Listen 80$/Listen {port}/' /etc/httpd/conf/httpd.conf
cat > /var/www/html/index.html <<'HTML'
{page}
HTML
systemctl enable --now httpd
"#
    )
}

fn render_page(ctx: &BootstrapContext<'_>) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<p>Served by {instance} in stack {stack}.</p>\n</body>\n</html>",
        title = escape_html(ctx.title),
        instance = escape_html(ctx.instance),
        stack = escape_html(ctx.stack),
    )
}

fn escape_html(input: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_data_identifies_instance() {
        let script = render_user_data(&BootstrapContext {
            stack: "shop-prod",
            instance: "web-2",
            title: "Shop <beta>",
            port: 8080,
        });
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("Served by web-2 in stack shop-prod."));
        assert!(script.contains("Shop &lt;beta&gt;"));
        assert!(script.contains("Listen 8080"));
    }

    #[test]
    fn test_user_data_is_deterministic() {
        let ctx = BootstrapContext {
            stack: "s",
            instance: "web-1",
            title: "t",
            port: 80,
        };
        assert_eq!(render_user_data(&ctx), render_user_data(&ctx));
    }
}
