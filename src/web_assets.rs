//! Web Assets Module
//!
//! Static web UI embedded in the binary. Only paths present here are served;
//! everything else falls through to the proxy handler.

pub struct StaticAsset {
    pub content_type: &'static str,
    pub body: &'static str,
}

pub fn lookup(path: &str) -> Option<StaticAsset> {
    match path {
        "/" | "/index.html" => Some(StaticAsset {
            content_type: "text/html",
            body: INDEX_HTML,
        }),
        "/style.css" => Some(StaticAsset {
            content_type: "text/css",
            body: STYLE_CSS,
        }),
        "/app.js" => Some(StaticAsset {
            content_type: "application/javascript",
            body: APP_JS,
        }),
        _ => None,
    }
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>OCI Proxy</title>
    <link rel="stylesheet" href="/style.css">
</head>
<body>
    <header>
        <h1>OCI Proxy</h1>
        <div id="status">checking&hellip;</div>
    </header>

    <main>
        <section>
            <h2>Cache Statistics</h2>
            <p class="hint">Pull through this proxy with
                <code id="pull-example">docker pull &lt;proxy&gt;/v2/&lt;image&gt;</code></p>
            <table id="stats-table">
                <thead>
                    <tr>
                        <th>Registry</th>
                        <th>Hits</th>
                        <th>Misses</th>
                        <th>Evictions</th>
                        <th>Items</th>
                        <th>Size</th>
                        <th>Max Size</th>
                    </tr>
                </thead>
                <tbody id="stats-body">
                    <tr><td colspan="7">Loading&hellip;</td></tr>
                </tbody>
            </table>
        </section>
    </main>

    <script src="/app.js"></script>
</body>
</html>
"#;

const STYLE_CSS: &str = r#"* { box-sizing: border-box; }
body {
    margin: 0;
    font-family: -apple-system, "Segoe UI", Roboto, sans-serif;
    color: #1f2430;
    background: #f5f6f8;
}
header {
    display: flex;
    align-items: baseline;
    justify-content: space-between;
    padding: 16px 24px;
    background: #23303f;
    color: #fff;
}
header h1 { margin: 0; font-size: 20px; }
#status { font-size: 14px; opacity: 0.85; }
main { max-width: 880px; margin: 24px auto; padding: 0 16px; }
section { background: #fff; border-radius: 6px; padding: 16px 20px; box-shadow: 0 1px 3px rgba(0,0,0,0.08); }
.hint { color: #5a6372; font-size: 14px; }
code { background: #eef0f3; padding: 2px 5px; border-radius: 3px; }
table { width: 100%; border-collapse: collapse; margin-top: 12px; }
th, td { text-align: left; padding: 8px 10px; border-bottom: 1px solid #e4e7eb; font-size: 14px; }
th { color: #5a6372; font-weight: 600; }
tr:last-child td { border-bottom: none; }
"#;

const APP_JS: &str = r#"function formatBytes(n) {
    if (n <= 0) return n === 0 ? '0 B' : 'unlimited';
    const units = ['B', 'KiB', 'MiB', 'GiB', 'TiB'];
    let i = 0;
    while (n >= 1024 && i < units.length - 1) { n /= 1024; i++; }
    return n.toFixed(i === 0 ? 0 : 1) + ' ' + units[i];
}

async function refreshHealth() {
    const el = document.getElementById('status');
    try {
        const resp = await fetch('/_/health');
        const body = await resp.json();
        el.textContent = body.status;
    } catch (e) {
        el.textContent = 'unreachable';
    }
}

async function refreshStats() {
    const body = document.getElementById('stats-body');
    try {
        const resp = await fetch('/_/stats');
        if (resp.status === 401) {
            body.innerHTML = '<tr><td colspan="7">Authentication required</td></tr>';
            return;
        }
        const stats = await resp.json();
        const hosts = Object.keys(stats).sort();
        if (hosts.length === 0) {
            body.innerHTML = '<tr><td colspan="7">No traffic yet</td></tr>';
            return;
        }
        body.innerHTML = hosts.map(function (host) {
            const s = stats[host];
            return '<tr><td>' + host + '</td><td>' + s.Hits + '</td><td>' + s.Misses +
                '</td><td>' + s.Evictions + '</td><td>' + s.Items +
                '</td><td>' + formatBytes(s.CurrentSize) + '</td><td>' + formatBytes(s.MaxSize) +
                '</td></tr>';
        }).join('');
    } catch (e) {
        body.innerHTML = '<tr><td colspan="7">Failed to load stats</td></tr>';
    }
}

refreshHealth();
refreshStats();
setInterval(refreshStats, 5000);
"#;
