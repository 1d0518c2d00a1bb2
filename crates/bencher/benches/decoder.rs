use std::hint::black_box;

use bencher::{TestCase, TestInput};
use bytes::BytesMut;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use gale_http::codec::{PayloadDecoder, RequestHeadDecoder, body_framing};
use tokio_util::codec::Decoder;

static SMALL_HEAD: TestInput = TestInput::new(
    "get_small",
    b"GET /index.html HTTP/1.1\r\nHost: 127.0.0.1:8080\r\nUser-Agent: curl/8.5.0\r\nAccept: */*\r\n\r\n",
);

static LARGE_HEAD: TestInput = TestInput::new(
    "get_large",
    b"GET /api/v1/users/42/profile?fields=name,email,avatar&expand=teams HTTP/1.1\r\n\
Host: api.example.com\r\n\
User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0\r\n\
Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
Accept-Language: en-US,en;q=0.5\r\n\
Accept-Encoding: gzip, deflate, br\r\n\
Referer: https://www.example.com/dashboard\r\n\
Connection: keep-alive\r\n\
Cookie: session=8f14e45fceea167a5a36dedd4bea2543; theme=dark; tracking=off; locale=en_US\r\n\
Upgrade-Insecure-Requests: 1\r\n\
Sec-Fetch-Dest: document\r\n\
Sec-Fetch-Mode: navigate\r\n\
Sec-Fetch-Site: same-origin\r\n\
Cache-Control: max-age=0\r\n\
X-Request-Id: 0b6c5d1e-7f7a-4c61-9d55-0cf6a1d4e3b2\r\n\r\n",
);

static CHUNKED_BODY: TestInput = TestInput::new(
    "post_chunked",
    b"POST /upload HTTP/1.1\r\nHost: 127.0.0.1\r\nTransfer-Encoding: chunked\r\n\r\n\
10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n10\r\n0123456789abcdef\r\n0\r\n\r\n",
);

fn head_cases() -> Vec<TestCase> {
    vec![TestCase::small("small_head", SMALL_HEAD), TestCase::normal("large_head", LARGE_HEAD)]
}

fn benchmark_head_decoder(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("request_head_decoder");

    for case in head_cases() {
        group.throughput(Throughput::Bytes(case.bytes().len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(case.name()), &case, |b, case| {
            let mut decoder = RequestHeadDecoder::default();
            b.iter_batched_ref(
                || BytesMut::from(case.bytes()),
                |buffer| {
                    let head = decoder.decode(buffer).expect("input should be a valid request head").unwrap();
                    black_box(head);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_chunked_body(criterion: &mut Criterion) {
    let case = TestCase::normal("chunked_body", CHUNKED_BODY);
    let mut group = criterion.benchmark_group("payload_decoder");
    group.throughput(Throughput::Bytes(case.bytes().len() as u64));

    group.bench_function(case.input().label(), |b| {
        b.iter_batched_ref(
            || BytesMut::from(case.bytes()),
            |buffer| {
                let (_, headers) = RequestHeadDecoder::default().decode(buffer).expect("valid head").unwrap();
                let mut body = PayloadDecoder::from(body_framing(&headers, None, u64::MAX).expect("valid framing"));
                while let Some(chunk) = body.decode(buffer).expect("valid chunked body") {
                    if chunk.is_eof() {
                        break;
                    }
                    black_box(chunk);
                }
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(decoder, benchmark_head_decoder, benchmark_chunked_body);
criterion_main!(decoder);
