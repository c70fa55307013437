use mimetree_rs::structured::StructuredMime;
use std::io::Read;

fn parse_all(
    raw: &[u8],
) -> Result<(mimetree_rs::Part, Vec<(String, Vec<u8>)>, StructuredMime), mimetree_rs::Error> {
    let mut bodies: Vec<(String, Vec<u8>)> = Vec::new();
    let mut sm = StructuredMime::new();
    let root = mimetree_rs::parse(
        raw,
        |body| {
            let mut data = Vec::new();
            body.read_to_end(&mut data)?;
            bodies.push((body.part().content_type.media_type(), data));
            Ok(())
        },
        |part| sm.collect(part),
    )?;
    Ok((root, bodies, sm))
}

#[test]
fn nested_multipart() -> Result<(), mimetree_rs::Error> {
    let raw_mail = b"\
Delivered-To: efgh@promignis.com\n\
MIME-Version: 1.0\n\
From: revant jha <abc.94@gmail.com>\n\
Date: Tue, 27 Oct 2020 16:11:25 +0530\n\
Message-ID: <CALa9RR=0AnAvVYBN_XeuZ+z51M7Em-i_RoYC3Ur8WmEt4h+mig@mail.gmail.com>\n\
Subject: test eml\n\
To: efgh@promignis.com\n\
Content-Type: multipart/mixed; boundary=\"main1\"\n\
\n\
--main1\n\
Content-Type: multipart/alternative; boundary=\"sub1\"\n\
\n\
--sub1\n\
Content-Type: text/plain; charset=\"UTF-8\"\n\
\n\
Hi this is the body\n\
--sub1\n\
Content-Type: text/html; charset=\"UTF-8\"\n\
\n\
<div dir=\"ltr\">Hi this is the body<div><br></div></div>\n\
--sub1--\n\
--main1\n\
Content-Type: text/plain; charset=\"US-ASCII\"; name=\"attac.txt\"\n\
Content-Disposition: attachment; filename=\"attac.txt\"\n\
Content-Transfer-Encoding: base64\n\
Content-ID: <f_kgruatpx0>\n\
X-Attachment-Id: f_kgruatpx0\n\
\n\
U2FtcGxlVGV4dCBkYXRhIGhlcmUg\n\
--main1--\n";
    let (root, bodies, sm) = parse_all(raw_mail)?;

    // The tree: mixed -> [alternative -> [plain, html], attachment]
    assert_eq!(root.multipart, "mixed");
    assert_eq!(root.boundary, "main1");
    let children = root.children.as_ref().unwrap();
    assert_eq!(children.len(), 2);

    let alt = &children[0];
    assert_eq!(alt.multipart, "alternative");
    assert_eq!(alt.boundary, "sub1");
    let leaves = alt.children.as_ref().unwrap();
    assert_eq!(leaves.len(), 2);
    assert_eq!(leaves[0].content_type.media_type(), "text/plain");
    assert_eq!(leaves[0].charset(), Some("UTF-8"));
    assert!(leaves[0].children.is_none());
    assert_eq!(leaves[1].content_type.media_type(), "text/html");

    let attachment = &children[1];
    assert!(attachment.children.is_none());
    assert!(!attachment.is_inline());
    assert_eq!(attachment.filename(), Some("attac.txt"));
    assert_eq!(
        attachment
            .content_disposition
            .as_ref()
            .unwrap()
            .media_type
            .as_str(),
        "attachment"
    );
    assert_eq!(attachment.content_transfer_encoding(), Some(" base64"));
    assert_eq!(attachment.headers.last("content-id"), Some(" <f_kgruatpx0>"));

    // Bodies in document order, transfer decoding applied
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0].0, "text/plain");
    assert_eq!(bodies[0].1, b"Hi this is the body\n");
    assert_eq!(bodies[1].0, "text/html");
    assert_eq!(
        bodies[1].1,
        b"<div dir=\"ltr\">Hi this is the body<div><br></div></div>\n"
    );
    assert_eq!(bodies[2].0, "text/plain");
    assert_eq!(bodies[2].1, b"SampleText data here ");

    // Sizes account the decoded bytes
    assert_eq!(leaves[0].size, 20);
    assert_eq!(attachment.size, 21);
    assert_eq!(root.size, 0);

    // Structured headers collected from the outermost part
    assert_eq!(sm.subject, "test eml");
    assert_eq!(
        sm.message_id,
        "<CALa9RR=0AnAvVYBN_XeuZ+z51M7Em-i_RoYC3Ur8WmEt4h+mig@mail.gmail.com>"
    );
    assert_eq!(sm.date.unwrap().unix_timestamp(), 1603795285);
    assert_eq!(sm.from[0].name, "revant jha");
    assert_eq!(sm.from[0].address, "abc.94@gmail.com");
    assert_eq!(sm.to[0].address, "efgh@promignis.com");
    assert_eq!(sm.delivered_to[0].address, "efgh@promignis.com");
    assert_eq!(sm.headers.get("mime-version").unwrap(), [" 1.0"]);
    Ok(())
}

#[test]
fn preamble_and_epilogue() -> Result<(), mimetree_rs::Error> {
    let raw_mail = b"\
From: me <me@myself>\n\
Message-ID: <x@y>\n\
Content-Type: multipart/mixed; boundary=outer\n\
\n\
Outer preamble\n\
--outer\n\
Content-Type: multipart/alternative; boundary=\"inner\"\n\
\n\
Inner preamble\n\
--inner\n\
Content-Type: text/plain; charset=utf-8\n\
Content-Transfer-Encoding: 7bit\n\
\n\
Text\n\
--inner\n\
Content-type: text/html\n\
\n\
<p>Html</p>\n\
--inner--\n\
Inner epilogue\n\
\n\
--outer\n\
Content-type: application/octet-stream\n\
Content-Transfer-Encoding: binary\n\
\n\
Binary data\n\
--outer--\n\
Epilogue\n";
    let (root, bodies, _) = parse_all(raw_mail)?;
    assert_eq!(root.multipart, "mixed");
    let children = root.children.as_ref().unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].multipart, "alternative");
    assert_eq!(children[0].children.as_ref().unwrap().len(), 2);
    assert_eq!(children[1].content_type.media_type(), "application/octet-stream");

    // Preambles and epilogues are invisible to the body callback
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0].1, b"Text\n");
    assert_eq!(bodies[1].1, b"<p>Html</p>\n");
    assert_eq!(bodies[2].1, b"Binary data\n");
    Ok(())
}

#[test]
fn boundary_lookalikes_stay_in_body() -> Result<(), mimetree_rs::Error> {
    let raw_mail = b"\
From: me <me@myself>\n\
Message-ID: <x@y>\n\
Content-Type: multipart/mixed; boundary=bound\n\
\n\
--bound\n\
Content-Type: text/plain\n\
\n\
a --boundless line\n\
--boundX is no delimiter either\n\
almost: --boun\n\
--bound\n\
Content-Type: text/plain\n\
\n\
second\n\
--bound--\n";
    let (root, bodies, _) = parse_all(raw_mail)?;
    assert_eq!(root.children.as_ref().unwrap().len(), 2);
    assert_eq!(bodies.len(), 2);
    assert_eq!(
        bodies[0].1.as_slice(),
        b"a --boundless line\n--boundX is no delimiter either\nalmost: --boun\n".as_slice()
    );
    assert_eq!(bodies[1].1, b"second\n");
    Ok(())
}

#[test]
fn defaulted_child_content_type() -> Result<(), mimetree_rs::Error> {
    let raw_mail = b"\
From: me <me@myself>\n\
Message-ID: <x@y>\n\
Content-Type: multipart/mixed; boundary=b\n\
\n\
--b\n\
\n\
implicit\n\
--b--\n";
    let (root, bodies, _) = parse_all(raw_mail)?;
    let child = &root.children.as_ref().unwrap()[0];
    // Every part carries a content type, declared or not
    assert_eq!(child.headers.last("content-type"), Some("text/plain"));
    assert_eq!(child.content_type.media_type(), "text/plain");
    assert_eq!(bodies[0].1, b"implicit\n");
    Ok(())
}

#[test]
fn empty_multipart() -> Result<(), mimetree_rs::Error> {
    let raw_mail = b"\
From: me <me@myself>\n\
Message-ID: <x@y>\n\
Content-Type: multipart/mixed; boundary=bound\n\
\n\
--bound--\n";
    let (root, bodies, _) = parse_all(raw_mail)?;
    assert_eq!(root.multipart, "mixed");
    assert!(root.children.is_none());
    assert!(bodies.is_empty());
    Ok(())
}
