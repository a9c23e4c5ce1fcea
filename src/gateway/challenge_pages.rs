//! HTML bodies for the browser challenge pages.
//!
//! The arithmetic page carries its token only inside the inline
//! script: a client that never executes it never obtains the cookie.
//! The proof-of-work page also gets the token via `Set-Cookie` since
//! possession alone proves nothing there.

use rand::Rng;

/// The arithmetic JS challenge. The real check is the cookie round
/// trip: the verification flag was stored when this page was issued,
/// and the arithmetic result is never sent back.
pub fn js_challenge_page(cookie_name: &str, token: &str, lifetime_secs: u64) -> String {
    let mut rng = rand::thread_rng();
    let a: u32 = rng.gen_range(1..50);
    let b: u32 = rng.gen_range(1..50);
    let c: u32 = rng.gen_range(1..50);
    let expected = a + b * c;
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Checking your browser</title>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<style>
body {{ font-family: Arial, sans-serif; text-align: center; padding: 50px; }}
</style>
</head>
<body>
<h2>Checking your browser</h2>
<p>This will only take a moment.</p>
<script>
(function () {{
    var a = {a}, b = {b}, c = {c};
    if (a + b * c === {expected}) {{
        document.cookie = "{cookie_name}={token}; path=/; max-age={lifetime_secs}";
        setTimeout(function () {{ window.location.reload(true); }}, 600);
    }}
}})();
</script>
</body>
</html>
"#
    )
}

/// The proof-of-work challenge. The script brute-forces a nonce until
/// sha256(token + nonce) has the required leading zeros, then posts
/// `nonce:hash` back to the same URL.
pub fn pow_challenge_page(
    cookie_name: &str,
    token: &str,
    difficulty: usize,
    lifetime_secs: u64,
) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>Verifying your request</title>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<style>
body {{ font-family: Arial, sans-serif; text-align: center; padding: 50px; }}
#progress {{ color: #888; }}
</style>
</head>
<body>
<h2>Verifying your request</h2>
<p id="progress">Computing&hellip;</p>
<form id="powForm" method="post" style="display:none">
<input type="hidden" name="pow_solution" id="powSolution">
</form>
<script>
(function () {{
    var token = "{token}";
    var difficulty = {difficulty};
    var target = "0".repeat(difficulty);
    document.cookie = "{cookie_name}=" + token + "; path=/; max-age={lifetime_secs}";

    async function sha256hex(text) {{
        var data = new TextEncoder().encode(text);
        var digest = await crypto.subtle.digest("SHA-256", data);
        return Array.from(new Uint8Array(digest))
            .map(function (b) {{ return b.toString(16).padStart(2, "0"); }})
            .join("");
    }}

    async function solve() {{
        for (var nonce = 0; ; nonce++) {{
            var hash = await sha256hex(token + nonce);
            if (hash.substring(0, difficulty) === target) {{
                document.getElementById("powSolution").value = nonce + ":" + hash;
                document.getElementById("powForm").submit();
                return;
            }}
            if (nonce % 500 === 0) {{
                document.getElementById("progress").textContent =
                    "Computing… " + nonce + " attempts";
            }}
        }}
    }}

    solve();
}})();
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
    fn js_page_embeds_cookie_and_token() {
        let page = js_challenge_page("sg_token", "abc123", 120);
        assert!(page.contains("sg_token=abc123"));
        assert!(page.contains("max-age=120"));
        assert!(page.contains("window.location.reload"));
        assert!(page.contains("a + b * c"));
    }

    #[test]
    fn pow_page_embeds_token_and_difficulty() {
        let page = pow_challenge_page("sg_token", "tok", 4, 120);
        assert!(page.contains(r#"var token = "tok";"#));
        assert!(page.contains("var difficulty = 4;"));
        assert!(page.contains("pow_solution"));
    }
}
